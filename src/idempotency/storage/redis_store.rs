use super::Storage;
use crate::error::{AppError, Result};
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::outcome::StoredOutcome;
use crate::observability::get_metrics;
use crate::observability::LatencyTimer;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

/// Redis-backed outcome store. Entries expire with the configured TTL.
pub struct RedisStorage {
    client: redis::Client,
    key_prefix: String,
    ttl_seconds: i64,
}

impl RedisStorage {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>, ttl_seconds: i64) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            ttl_seconds,
        }
    }

    /// Keys are fingerprinted so arbitrary client input maps to a bounded Redis key.
    fn make_key(&self, key: &IdempotencyKey) -> String {
        format!("{}:outcome:{}", self.key_prefix, key.fingerprint())
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)
    }

    fn ttl(&self) -> usize {
        self.ttl_seconds.max(1) as usize
    }

    /// Cheap connectivity probe.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn read(&self, conn: &mut MultiplexedConnection, key: &str) -> Result<Option<StoredOutcome>> {
        let value: Option<String> = conn.get(key).await?;
        value.as_deref().map(StoredOutcome::from_json).transpose()
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<StoredOutcome>> {
        let timer = LatencyTimer::new();
        let mut conn = self.connection().await?;
        let result = self.read(&mut conn, &self.make_key(key)).await;
        get_metrics().record_storage_operation("redis", "get", timer.elapsed_ms(), result.is_ok());
        result
    }

    async fn set(&self, key: &IdempotencyKey, entry: &StoredOutcome) -> Result<()> {
        let timer = LatencyTimer::new();
        let json = entry.to_json()?;
        let mut conn = self.connection().await?;
        let result: Result<()> = conn
            .set_ex(self.make_key(key), json, self.ttl() as u64)
            .await
            .map_err(AppError::Redis);
        get_metrics().record_storage_operation("redis", "set", timer.elapsed_ms(), result.is_ok());
        result
    }

    async fn insert_if_absent(
        &self,
        key: &IdempotencyKey,
        entry: &StoredOutcome,
    ) -> Result<Option<StoredOutcome>> {
        let timer = LatencyTimer::new();
        let redis_key = self.make_key(key);
        let json = entry.to_json()?;
        let mut conn = self.connection().await?;

        // SET NX can lose to a writer whose entry then expires before our GET; retry once.
        for _ in 0..2 {
            let inserted: Option<String> = conn
                .set_options(
                    &redis_key,
                    &json,
                    redis::SetOptions::default()
                        .conditional_set(redis::ExistenceCheck::NX)
                        .with_expiration(redis::SetExpiry::EX(self.ttl())),
                )
                .await
                .map_err(AppError::Redis)?;

            if inserted.is_some() {
                get_metrics().record_storage_operation("redis", "insert", timer.elapsed_ms(), true);
                return Ok(None);
            }

            if let Some(existing) = self.read(&mut conn, &redis_key).await? {
                get_metrics().record_storage_operation("redis", "insert", timer.elapsed_ms(), true);
                return Ok(Some(existing));
            }
        }

        get_metrics().record_storage_operation("redis", "insert", timer.elapsed_ms(), false);
        Err(AppError::Storage(
            "redis entry vanished during insert-if-absent".to_string(),
        ))
    }
}
