use crate::idempotency::key::{KEY_HEADER, X_KEY_HEADER};
use thiserror::Error;
use tonic::{Code, Status};

pub type Result<T> = std::result::Result<T, AppError>;

/// Errors raised by the idempotency layer itself.
///
/// Handler failures and ACL failures are `tonic::Status` values owned by the
/// caller and never pass through this type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("header {} or {} not found", KEY_HEADER, X_KEY_HEADER)]
    MissingKey,

    #[error("invalid idempotency key: {0}")]
    InvalidKey(String),

    #[error("request with idempotency key already in progress")]
    InFlight,

    #[error("idempotency key was recorded for {stored}, not {requested}")]
    ShapeMismatch { stored: String, requested: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// True for failures of the backing store, as opposed to a cache miss.
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Migration(_) | AppError::Redis(_) | AppError::Storage(_)
        )
    }

    /// gRPC classification of this error.
    pub fn code(&self) -> Code {
        match self {
            AppError::MissingKey | AppError::InvalidKey(_) => Code::InvalidArgument,
            AppError::InFlight => Code::Aborted,
            AppError::ShapeMismatch { .. } => Code::FailedPrecondition,
            _ => Code::Internal,
        }
    }
}

impl From<AppError> for Status {
    fn from(err: AppError) -> Self {
        match err.code() {
            Code::Internal => {
                // Backend details stay in the logs.
                tracing::error!(error = %err, "Idempotency layer internal failure");
                if err.is_storage_error() {
                    Status::internal("idempotency storage failure")
                } else {
                    Status::internal("idempotency internal error")
                }
            }
            code => Status::new(code, err.to_string()),
        }
    }
}
