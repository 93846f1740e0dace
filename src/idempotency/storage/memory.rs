use super::Storage;
use crate::config::MAX_TTL_SECONDS;
use crate::error::Result;
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::outcome::StoredOutcome;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct MemoryEntry {
    entry: StoredOutcome,
    expires_at: DateTime<Utc>,
}

impl MemoryEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Process-local store. Does not survive restarts; meant for tests and
/// single-instance deployments.
#[derive(Debug)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    ttl: Duration,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(86400)
    }
}

impl MemoryStorage {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: Duration::seconds(ttl_seconds.clamp(-MAX_TTL_SECONDS, MAX_TTL_SECONDS)),
        }
    }

    pub async fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops expired entries, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    fn wrap(&self, entry: &StoredOutcome) -> MemoryEntry {
        MemoryEntry {
            entry: entry.clone(),
            expires_at: Utc::now() + self.ttl,
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<StoredOutcome>> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key.as_str())
            .filter(|e| !e.is_expired(now))
            .map(|e| e.entry.clone()))
    }

    async fn set(&self, key: &IdempotencyKey, entry: &StoredOutcome) -> Result<()> {
        let wrapped = self.wrap(entry);
        self.entries
            .write()
            .await
            .insert(key.as_str().to_string(), wrapped);
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        key: &IdempotencyKey,
        entry: &StoredOutcome,
    ) -> Result<Option<StoredOutcome>> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(key.as_str()).filter(|e| !e.is_expired(now)) {
            return Ok(Some(existing.entry.clone()));
        }
        entries.insert(key.as_str().to_string(), self.wrap(entry));
        Ok(None)
    }
}
