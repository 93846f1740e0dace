//! Single-execution coordinator.
//!
//! For a given key the handler runs at most once while a recorded outcome
//! exists. Concurrent duplicates inside this process are coalesced through an
//! in-flight table; duplicates in other processes are settled by the storage
//! backend's insert-if-absent.

use crate::config::{IdempotencySettings, InFlightPolicy};
use crate::error::{AppError, Result};
use crate::idempotency::acl::ResultShape;
use crate::idempotency::key::IdempotencyKey;
use crate::idempotency::outcome::{Outcome, StoredOutcome};
use crate::idempotency::storage::Storage;
use crate::observability::{get_metrics, LatencyTimer};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tonic::{Code, Status};

/// Cache statistics for monitoring.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub executions: AtomicU64,
    pub replays: AtomicU64,
    pub coalesced: AtomicU64,
    pub rejected: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay(&self) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub executions: u64,
    pub replays: u64,
    pub coalesced: u64,
    pub rejected: u64,
    pub storage_errors: u64,
}

impl CacheStatsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        let total = self.executions + self.replays;
        if total == 0 {
            0.0
        } else {
            self.replays as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub in_flight_policy: InFlightPolicy,
    pub in_flight_wait: Duration,
    /// Record `CANCELLED`/`DEADLINE_EXCEEDED` outcomes instead of leaving the key retryable.
    pub cache_cancellations: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&IdempotencySettings::default())
    }
}

impl From<&IdempotencySettings> for CacheConfig {
    fn from(settings: &IdempotencySettings) -> Self {
        Self {
            in_flight_policy: settings.in_flight_policy,
            in_flight_wait: settings.in_flight_wait(),
            cache_cancellations: settings.cache_cancellations,
        }
    }
}

/// How a call was answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution<T> {
    /// This call ran the handler.
    Executed(T),
    /// A recorded outcome was returned instead.
    Replayed(T),
}

impl<T> Execution<T> {
    pub fn is_replay(&self) -> bool {
        matches!(self, Execution::Replayed(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Execution::Executed(value) | Execution::Replayed(value) => value,
        }
    }
}

#[derive(Debug, Clone)]
enum FlightState {
    Running,
    Published(StoredOutcome),
}

impl FlightState {
    fn is_published(&self) -> bool {
        matches!(self, FlightState::Published(_))
    }

    fn published(&self) -> Option<&StoredOutcome> {
        match self {
            FlightState::Published(entry) => Some(entry),
            FlightState::Running => None,
        }
    }
}

type FlightTable = Mutex<HashMap<IdempotencyKey, Arc<watch::Sender<FlightState>>>>;

fn lock(table: &FlightTable) -> MutexGuard<'_, HashMap<IdempotencyKey, Arc<watch::Sender<FlightState>>>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Admission<'a> {
    Leader(FlightGuard<'a>),
    Follower(watch::Receiver<FlightState>),
}

/// Held by the admitted caller. Dropping it removes the in-flight entry; if
/// nothing was published, waiting followers see the channel close and retry.
struct FlightGuard<'a> {
    table: &'a FlightTable,
    key: IdempotencyKey,
    sender: Arc<watch::Sender<FlightState>>,
}

impl FlightGuard<'_> {
    fn publish(&self, entry: StoredOutcome) {
        self.sender.send_replace(FlightState::Published(entry));
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut table = lock(self.table);
        if table
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.sender))
        {
            table.remove(&self.key);
        }
        get_metrics().set_in_flight(table.len());
    }
}

fn is_transient(status: &Status) -> bool {
    matches!(status.code(), Code::Cancelled | Code::DeadlineExceeded)
}

pub struct ResultCache {
    storage: Arc<dyn Storage>,
    config: CacheConfig,
    in_flight: FlightTable,
    stats: Arc<CacheStats>,
}

impl ResultCache {
    pub fn new(storage: Arc<dyn Storage>, config: CacheConfig) -> Self {
        Self {
            storage,
            config,
            in_flight: Mutex::new(HashMap::new()),
            stats: Arc::new(CacheStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    /// Number of keys currently executing in this process.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Returns the recorded outcome for `key`, or runs `handler` as the single
    /// admitted caller and records what it produced.
    pub async fn execute_once<T, F, Fut>(
        &self,
        key: &IdempotencyKey,
        shape: &ResultShape,
        handler: F,
    ) -> std::result::Result<Execution<T>, Status>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, Status>>,
    {
        let guard = loop {
            if let Some(entry) = self.lookup(key, shape).await? {
                return self.replay(key, &entry);
            }

            match self.admit(key) {
                Admission::Leader(guard) => {
                    // A previous leader may have published between the lookup and admission.
                    if let Some(entry) = self.lookup(key, shape).await? {
                        return self.replay(key, &entry);
                    }
                    break guard;
                }
                Admission::Follower(rx) => {
                    if let Some(entry) = self.await_leader(key, rx).await? {
                        entry.ensure_shape(shape)?;
                        self.stats.record_coalesced();
                        return self.replay(key, &entry);
                    }
                    tracing::debug!(key = %key.masked(), "In-flight execution abandoned; retrying admission");
                }
            }
        };

        self.lead(guard, key, shape, handler).await
    }

    async fn lookup(&self, key: &IdempotencyKey, shape: &ResultShape) -> Result<Option<StoredOutcome>> {
        match self.storage.get(key).await {
            Ok(Some(entry)) => {
                entry.ensure_shape(shape)?;
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.stats.record_storage_error();
                get_metrics().record_storage_error("get");
                tracing::error!(key = %key.masked(), "Idempotency lookup failed: {}", e);
                Err(e)
            }
        }
    }

    fn admit(&self, key: &IdempotencyKey) -> Admission<'_> {
        let mut table = lock(&self.in_flight);
        if let Some(sender) = table.get(key) {
            return Admission::Follower(sender.subscribe());
        }

        let (sender, _) = watch::channel(FlightState::Running);
        let sender = Arc::new(sender);
        table.insert(key.clone(), Arc::clone(&sender));
        get_metrics().set_in_flight(table.len());

        Admission::Leader(FlightGuard {
            table: &self.in_flight,
            key: key.clone(),
            sender,
        })
    }

    /// Waits for the leader's outcome. `Ok(None)` means the leader gave up.
    async fn await_leader(
        &self,
        key: &IdempotencyKey,
        mut rx: watch::Receiver<FlightState>,
    ) -> Result<Option<StoredOutcome>> {
        if self.config.in_flight_policy == InFlightPolicy::Reject {
            self.stats.record_rejected();
            return Err(AppError::InFlight);
        }

        tracing::debug!(key = %key.masked(), "Duplicate call waiting for in-flight execution");
        let published = match tokio::time::timeout(
            self.config.in_flight_wait,
            rx.wait_for(FlightState::is_published),
        )
        .await
        {
            Ok(Ok(state)) => state.published().cloned(),
            Ok(Err(_)) => None,
            Err(_) => {
                self.stats.record_rejected();
                tracing::warn!(key = %key.masked(), "Timed out waiting for in-flight execution");
                return Err(AppError::InFlight);
            }
        };
        Ok(published)
    }

    async fn lead<T, F, Fut>(
        &self,
        guard: FlightGuard<'_>,
        key: &IdempotencyKey,
        shape: &ResultShape,
        handler: F,
    ) -> std::result::Result<Execution<T>, Status>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, Status>>,
    {
        self.stats.record_execution();
        tracing::debug!(key = %key.masked(), shape = %shape, "Admitted; executing handler");

        let timer = LatencyTimer::new();
        let result = handler().await;
        get_metrics().record_handler_latency(shape.as_str(), timer.elapsed_ms(), result.is_ok());

        let outcome = match &result {
            Ok(response) => Some(Outcome::success(response)?),
            Err(status) if is_transient(status) && !self.config.cache_cancellations => None,
            Err(status) => Some(Outcome::failure(status)),
        };
        let Some(outcome) = outcome else {
            tracing::info!(key = %key.masked(), "Handler interrupted; outcome left unrecorded");
            return result.map(Execution::Executed);
        };

        let entry = StoredOutcome::new(shape.clone(), outcome);
        let (winner, ours) = match self.storage.insert_if_absent(key, &entry).await {
            Ok(None) => (entry, true),
            Ok(Some(existing)) => {
                tracing::warn!(key = %key.masked(), "Outcome already recorded by another writer; replaying it");
                (existing, false)
            }
            Err(e) => {
                self.stats.record_storage_error();
                get_metrics().record_storage_error("insert");
                tracing::error!(key = %key.masked(), "Failed to record idempotency outcome: {}", e);
                return Err(e.into());
            }
        };

        guard.publish(winner.clone());
        drop(guard);

        if ours {
            result.map(Execution::Executed)
        } else {
            winner.ensure_shape(shape)?;
            self.replay(key, &winner)
        }
    }

    fn replay<T: DeserializeOwned>(
        &self,
        key: &IdempotencyKey,
        entry: &StoredOutcome,
    ) -> std::result::Result<Execution<T>, Status> {
        self.stats.record_replay();
        tracing::debug!(
            key = %key.masked(),
            success = entry.outcome.is_success(),
            "Replaying recorded outcome"
        );
        entry.outcome.replay().map(Execution::Replayed)
    }
}
