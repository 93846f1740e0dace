use crate::error::{AppError, Result};
use crate::idempotency::acl::ResultShape;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tonic::{Code, Status};

/// Recorded result of the single admitted execution for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        payload: serde_json::Value,
    },
    Failure {
        code: i32,
        message: String,
        /// Hex-encoded binary status details.
        #[serde(default, skip_serializing_if = "String::is_empty")]
        details: String,
    },
}

impl Outcome {
    pub fn success<T: Serialize>(response: &T) -> Result<Self> {
        Ok(Outcome::Success {
            payload: serde_json::to_value(response)?,
        })
    }

    /// Normalizes a handler failure so it can be replayed verbatim.
    pub fn failure(status: &Status) -> Self {
        Outcome::Failure {
            code: status.code() as i32,
            message: status.message().to_string(),
            details: hex::encode(status.details()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Rebuilds the original response or status.
    pub fn replay<T: DeserializeOwned>(&self) -> std::result::Result<T, Status> {
        match self {
            Outcome::Success { payload } => serde_json::from_value(payload.clone()).map_err(|e| {
                Status::from(AppError::Internal(anyhow::anyhow!(
                    "Failed to deserialize cached response: {}",
                    e
                )))
            }),
            Outcome::Failure {
                code,
                message,
                details,
            } => {
                let details = hex::decode(details).unwrap_or_default();
                Err(Status::with_details(
                    Code::from(*code),
                    message.clone(),
                    Bytes::from(details),
                ))
            }
        }
    }
}

/// Cache entry: an outcome plus the shape it was recorded under. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOutcome {
    pub shape: ResultShape,
    pub outcome: Outcome,
    pub recorded_at: DateTime<Utc>,
}

impl StoredOutcome {
    pub fn new(shape: ResultShape, outcome: Outcome) -> Self {
        Self {
            shape,
            outcome,
            recorded_at: Utc::now(),
        }
    }

    /// Fails when the entry was recorded for a different result shape.
    pub fn ensure_shape(&self, requested: &ResultShape) -> Result<()> {
        if &self.shape != requested {
            return Err(AppError::ShapeMismatch {
                stored: self.shape.to_string(),
                requested: requested.to_string(),
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
