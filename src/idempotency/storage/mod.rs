//! Backing stores for recorded outcomes.
//!
//! Every backend must serve concurrent readers and offer an atomic
//! insert-if-absent; that primitive is what keeps two processes from
//! recording different outcomes for one key.

pub mod memory;
pub mod postgres;
pub mod redis_store;
pub mod tiered;

pub use self::memory::MemoryStorage;
pub use self::postgres::{PostgresStorage, StorageCleanupJob};
pub use self::redis_store::RedisStorage;
pub use self::tiered::TieredStorage;

use crate::config::{Settings, StorageBackend};
use crate::error::{AppError, Result};
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::outcome::StoredOutcome;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Storage: Send + Sync {
    /// `Ok(None)` means no entry; backend failures are always `Err`.
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<StoredOutcome>>;

    /// Stores or overwrites the entry for `key`.
    async fn set(&self, key: &IdempotencyKey, entry: &StoredOutcome) -> Result<()>;

    /// Stores `entry` only when no live entry exists.
    /// Returns `Ok(None)` when stored, or the entry already present.
    async fn insert_if_absent(
        &self,
        key: &IdempotencyKey,
        entry: &StoredOutcome,
    ) -> Result<Option<StoredOutcome>>;
}

/// A built backend plus the durable tier, when there is one, for maintenance.
#[derive(Clone)]
pub struct StorageHandle {
    pub storage: Arc<dyn Storage>,
    pub durable: Option<Arc<PostgresStorage>>,
}

impl StorageHandle {
    /// Periodic purge of expired rows; only PostgreSQL-backed storage needs one.
    pub fn cleanup_job(&self, interval_seconds: u64) -> Option<StorageCleanupJob> {
        self.durable
            .clone()
            .map(|postgres| StorageCleanupJob::new(postgres, interval_seconds))
    }
}

/// Builds the backend selected by `idempotency.backend`.
pub async fn build_storage(settings: &Settings) -> Result<StorageHandle> {
    let idem = &settings.idempotency;
    let handle = match idem.backend {
        StorageBackend::Memory => StorageHandle {
            storage: Arc::new(MemoryStorage::new(idem.ttl_seconds)),
            durable: None,
        },
        StorageBackend::Redis => {
            let redis = RedisStorage::new(redis_client(settings)?, &idem.key_prefix, idem.ttl_seconds);
            redis.ping().await?;
            StorageHandle {
                storage: Arc::new(redis),
                durable: None,
            }
        }
        StorageBackend::Postgres => {
            let postgres = Arc::new(PostgresStorage::new(pg_pool(settings).await?, idem.ttl_seconds));
            postgres.migrate().await?;
            StorageHandle {
                storage: postgres.clone(),
                durable: Some(postgres),
            }
        }
        StorageBackend::Tiered => {
            let postgres = Arc::new(PostgresStorage::new(pg_pool(settings).await?, idem.ttl_seconds));
            postgres.migrate().await?;
            let redis = RedisStorage::new(redis_client(settings)?, &idem.key_prefix, idem.ttl_seconds);
            redis.ping().await?;
            StorageHandle {
                storage: Arc::new(TieredStorage::new(postgres.clone(), redis)),
                durable: Some(postgres),
            }
        }
    };

    tracing::info!(backend = ?idem.backend, ttl_seconds = idem.ttl_seconds, "Idempotency storage ready");
    Ok(handle)
}

fn redis_client(settings: &Settings) -> Result<redis::Client> {
    let redis_settings = settings
        .redis
        .as_ref()
        .ok_or_else(|| AppError::Validation("missing [redis] settings".to_string()))?;
    Ok(redis::Client::open(redis_settings.url.as_str())?)
}

async fn pg_pool(settings: &Settings) -> Result<sqlx::PgPool> {
    let database = settings
        .database
        .as_ref()
        .ok_or_else(|| AppError::Validation("missing [database] settings".to_string()))?;
    let pool = PgPoolOptions::new()
        .max_connections(database.pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database.url)
        .await?;
    Ok(pool)
}
