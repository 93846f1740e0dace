use crate::error::{AppError, Result};
use metrics::{counter, gauge, histogram, describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the idempotency layer.
#[derive(Debug, Clone)]
pub struct Metrics {
    initialized: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { initialized: true }
    }

    /// `result` is one of `executed`, `replayed`, `passthrough`, `rejected` or `error`.
    pub fn record_request(&self, method: &str, result: &str) {
        counter!("idempotency_requests_total", "method" => method.to_string(), "result" => result.to_string()).increment(1);
    }

    pub fn record_handler_latency(&self, shape: &str, duration_ms: f64, success: bool) {
        histogram!("idempotency_handler_duration_ms", "shape" => shape.to_string(), "success" => success.to_string()).record(duration_ms);
    }

    pub fn record_storage_operation(&self, backend: &str, operation: &str, duration_ms: f64, success: bool) {
        counter!("idempotency_storage_operations_total", "backend" => backend.to_string(), "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("idempotency_storage_operation_duration_ms", "backend" => backend.to_string(), "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_storage_error(&self, operation: &str) {
        counter!("idempotency_storage_errors_total", "operation" => operation.to_string()).increment(1);
    }

    pub fn set_in_flight(&self, count: usize) {
        gauge!("idempotency_in_flight").set(count as f64);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to install Prometheus recorder: {}", e)))?;
    describe_metrics();

    METRICS.get_or_init(Metrics::new);
    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!("idempotency_requests_total", Unit::Count, "Calls seen by the idempotency interceptor, by method and result");
    describe_histogram!("idempotency_handler_duration_ms", Unit::Milliseconds, "Latency of admitted handler executions in milliseconds");

    describe_counter!("idempotency_storage_operations_total", Unit::Count, "Storage backend operations");
    describe_histogram!("idempotency_storage_operation_duration_ms", Unit::Milliseconds, "Storage backend latency in milliseconds");
    describe_counter!("idempotency_storage_errors_total", Unit::Count, "Storage failures surfaced to callers");

    describe_gauge!("idempotency_in_flight", Unit::Count, "Keys currently executing in this process");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
