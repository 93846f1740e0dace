use super::Storage;
use crate::config::MAX_TTL_SECONDS;
use crate::error::{AppError, Result};
use crate::idempotency::acl::ResultShape;
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::outcome::{Outcome, StoredOutcome};
use crate::observability::{get_metrics, LatencyTimer};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
struct OutcomeRow {
    id: Uuid,
    result_shape: String,
    outcome: Json<Outcome>,
    created_at: DateTime<Utc>,
}

impl From<OutcomeRow> for StoredOutcome {
    fn from(row: OutcomeRow) -> Self {
        StoredOutcome {
            shape: ResultShape::named(row.result_shape),
            outcome: row.outcome.0,
            recorded_at: row.created_at,
        }
    }
}

/// PostgreSQL-backed outcome store; the durable tier.
pub struct PostgresStorage {
    pool: PgPool,
    ttl_seconds: i64,
}

impl PostgresStorage {
    pub fn new(pool: PgPool, ttl_seconds: i64) -> Self {
        Self { pool, ttl_seconds }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    fn expires_at(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from + Duration::seconds(self.ttl_seconds.clamp(-MAX_TTL_SECONDS, MAX_TTL_SECONDS))
    }

    /// Finds the live entry for a key.
    async fn find_by_key(&self, key: &IdempotencyKey) -> Result<Option<StoredOutcome>> {
        let row = sqlx::query_as::<_, OutcomeRow>(
            r#"
            SELECT id, result_shape, outcome, created_at
            FROM idempotency_outcomes
            WHERE idempotency_key = $1 AND expires_at > NOW()
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.map(StoredOutcome::from))
    }

    /// Deletes expired records.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_outcomes
            WHERE expires_at <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Deletes a specific record by key.
    pub async fn delete(&self, key: &IdempotencyKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_outcomes
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key.as_str())
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<StoredOutcome>> {
        let timer = LatencyTimer::new();
        let result = self.find_by_key(key).await;
        get_metrics().record_storage_operation("postgres", "get", timer.elapsed_ms(), result.is_ok());
        result
    }

    async fn set(&self, key: &IdempotencyKey, entry: &StoredOutcome) -> Result<()> {
        let timer = LatencyTimer::new();
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_outcomes (id, idempotency_key, result_shape, outcome, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (idempotency_key) DO UPDATE
            SET id = EXCLUDED.id, result_shape = EXCLUDED.result_shape, outcome = EXCLUDED.outcome,
                created_at = EXCLUDED.created_at, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.as_str())
        .bind(entry.shape.as_str())
        .bind(Json(&entry.outcome))
        .bind(entry.recorded_at)
        .bind(self.expires_at(entry.recorded_at))
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(AppError::Database);

        get_metrics().record_storage_operation("postgres", "set", timer.elapsed_ms(), result.is_ok());
        result
    }

    async fn insert_if_absent(
        &self,
        key: &IdempotencyKey,
        entry: &StoredOutcome,
    ) -> Result<Option<StoredOutcome>> {
        let timer = LatencyTimer::new();
        let id = Uuid::new_v4();

        // Takes over an expired row; a live row is left untouched and yields no RETURNING row.
        let inserted = sqlx::query_as::<_, OutcomeRow>(
            r#"
            INSERT INTO idempotency_outcomes (id, idempotency_key, result_shape, outcome, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (idempotency_key) DO UPDATE
            SET id = EXCLUDED.id, result_shape = EXCLUDED.result_shape, outcome = EXCLUDED.outcome,
                created_at = EXCLUDED.created_at, expires_at = EXCLUDED.expires_at
            WHERE idempotency_outcomes.expires_at <= NOW()
            RETURNING id, result_shape, outcome, created_at
            "#,
        )
        .bind(id)
        .bind(key.as_str())
        .bind(entry.shape.as_str())
        .bind(Json(&entry.outcome))
        .bind(entry.recorded_at)
        .bind(self.expires_at(entry.recorded_at))
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database);

        let result = match inserted {
            Ok(Some(row)) if row.id == id => Ok(None),
            Ok(_) => match self.find_by_key(key).await {
                Ok(Some(existing)) => Ok(Some(existing)),
                Ok(None) => Err(AppError::Storage(
                    "postgres entry vanished during insert-if-absent".to_string(),
                )),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        get_metrics().record_storage_operation("postgres", "insert", timer.elapsed_ms(), result.is_ok());
        result
    }
}

/// Background cleanup job for expired idempotency outcomes.
pub struct StorageCleanupJob {
    storage: Arc<PostgresStorage>,
    interval_seconds: u64,
}

impl StorageCleanupJob {
    pub fn new(storage: Arc<PostgresStorage>, interval_seconds: u64) -> Self {
        Self {
            storage,
            interval_seconds,
        }
    }

    /// Runs the cleanup job once.
    pub async fn run_once(&self) -> Result<u64> {
        self.storage.cleanup_expired().await
    }

    /// Starts the cleanup job in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(
                tokio::time::Duration::from_secs(self.interval_seconds)
            );

            loop {
                interval.tick().await;

                match self.storage.cleanup_expired().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!("Cleaned up {} expired idempotency outcomes", count);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to cleanup expired idempotency outcomes: {}", e);
                    }
                }
            }
        })
    }
}
