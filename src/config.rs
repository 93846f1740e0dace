use crate::error::{AppError, Result};
use serde::Deserialize;
use std::time::Duration;
use validator::Validate;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    pub redis: Option<RedisSettings>,
    pub database: Option<DatabaseSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationSettings {
    pub log_level: String,
    pub log_format: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Where recorded outcomes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Redis,
    Postgres,
    Tiered,
}

/// What a duplicate call does while the first call with its key is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InFlightPolicy {
    /// Wait for the running call and replay its outcome.
    Wait,
    /// Fail immediately with `ABORTED`.
    Reject,
}

/// Upper bound on `idempotency.ttl_seconds`: ten years.
pub const MAX_TTL_SECONDS: i64 = 315_360_000;

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct IdempotencySettings {
    pub backend: StorageBackend,
    #[validate(range(min = 1, max = 315_360_000))]
    pub ttl_seconds: i64,
    #[validate(length(min = 1, max = 64))]
    pub key_prefix: String,
    pub in_flight_policy: InFlightPolicy,
    #[validate(range(min = 1))]
    pub in_flight_wait_ms: u64,
    pub cache_cancellations: bool,
    #[validate(range(min = 1, max = 4096))]
    pub max_key_length: usize,
    #[validate(range(min = 1))]
    pub cleanup_interval_secs: u64,
    pub methods: Vec<MethodRule>,
}

/// Marks a method (or every method of a service via `/pkg.Service/*`) as idempotent.
#[derive(Debug, Clone, Deserialize)]
pub struct MethodRule {
    pub method: String,
    /// Result shape name; defaults to the method name itself.
    pub shape: Option<String>,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            ttl_seconds: 86400, // 24 hours
            key_prefix: "idem".to_string(),
            in_flight_policy: InFlightPolicy::Wait,
            in_flight_wait_ms: 30_000,
            cache_cancellations: false,
            max_key_length: 255,
            cleanup_interval_secs: 3600,
            methods: Vec::new(),
        }
    }
}

impl IdempotencySettings {
    pub fn in_flight_wait(&self) -> Duration {
        Duration::from_millis(self.in_flight_wait_ms)
    }
}

impl Settings {
    pub fn new() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parses settings from an inline TOML document.
    pub fn from_toml(source: &str) -> Result<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.idempotency
            .validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;

        let backend = self.idempotency.backend;
        if matches!(backend, StorageBackend::Redis | StorageBackend::Tiered) && self.redis.is_none() {
            return Err(AppError::Validation(format!(
                "backend {:?} requires a [redis] section",
                backend
            )));
        }
        if matches!(backend, StorageBackend::Postgres | StorageBackend::Tiered)
            && self.database.is_none()
        {
            return Err(AppError::Validation(format!(
                "backend {:?} requires a [database] section",
                backend
            )));
        }
        Ok(())
    }
}
