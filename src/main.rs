use rpc_idempotency::config::Settings;
use rpc_idempotency::idempotency::{build_storage, IdempotencyKey, Storage};
use rpc_idempotency::observability::{init_logging, init_metrics, LogConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;

    init_logging(&LogConfig::from(&settings.application));
    info!("Configuration loaded");

    let _metrics = init_metrics()?;
    info!("Metrics recorder installed");

    // Connect the configured backend; Postgres migrations run here.
    info!(backend = ?settings.idempotency.backend, "Connecting idempotency storage...");
    let handle = build_storage(&settings).await?;

    // Probe with a lookup.
    let probe = IdempotencyKey::new("startup-probe")?;
    handle.storage.get(&probe).await?;
    info!("Storage lookup succeeded");

    let policy = &settings.idempotency;
    info!(
        methods = policy.methods.len(),
        in_flight_policy = ?policy.in_flight_policy,
        ttl_seconds = policy.ttl_seconds,
        "Idempotency policy loaded"
    );

    if let Some(job) = handle.cleanup_job(policy.cleanup_interval_secs) {
        let removed = job.run_once().await?;
        info!("Initial cleanup removed {} expired outcomes", removed);
        info!("System startup verification complete: idempotency layer ready.");

        let cleanup = job.start();
        tokio::signal::ctrl_c().await?;
        cleanup.abort();
        info!("Shutting down");
        return Ok(());
    }

    info!("System startup verification complete: idempotency layer ready.");

    Ok(())
}
