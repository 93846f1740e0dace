use super::{PostgresStorage, RedisStorage, Storage};
use crate::error::Result;
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::outcome::StoredOutcome;
use async_trait::async_trait;
use std::sync::Arc;

/// Redis in front of PostgreSQL.
///
/// PostgreSQL is authoritative: insert-if-absent is decided there and Redis
/// only ever holds copies of recorded entries. A Redis failure falls through
/// to PostgreSQL rather than being read as a miss.
pub struct TieredStorage {
    postgres: Arc<PostgresStorage>,
    redis: RedisStorage,
}

impl TieredStorage {
    pub fn new(postgres: Arc<PostgresStorage>, redis: RedisStorage) -> Self {
        Self { postgres, redis }
    }

    async fn fill_cache(&self, key: &IdempotencyKey, entry: &StoredOutcome) {
        if let Err(e) = self.redis.set(key, entry).await {
            tracing::warn!(key = %key.masked(), "Failed to populate redis tier: {}", e);
        }
    }
}

#[async_trait]
impl Storage for TieredStorage {
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<StoredOutcome>> {
        match self.redis.get(key).await {
            Ok(Some(entry)) => return Ok(Some(entry)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key.masked(), "Redis tier read failed, using postgres: {}", e);
            }
        }

        let found = self.postgres.get(key).await?;
        if let Some(ref entry) = found {
            self.fill_cache(key, entry).await;
        }
        Ok(found)
    }

    async fn set(&self, key: &IdempotencyKey, entry: &StoredOutcome) -> Result<()> {
        self.postgres.set(key, entry).await?;
        self.fill_cache(key, entry).await;
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        key: &IdempotencyKey,
        entry: &StoredOutcome,
    ) -> Result<Option<StoredOutcome>> {
        let existing = self.postgres.insert_if_absent(key, entry).await?;
        let winner = existing.as_ref().unwrap_or(entry);
        self.fill_cache(key, winner).await;
        Ok(existing)
    }
}
