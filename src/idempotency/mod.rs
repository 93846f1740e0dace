//! Request idempotency for gRPC services.
//!
//! A call whose method is covered by the [`Acl`] must carry an idempotency key;
//! the first call with a key runs the handler and every later call with the
//! same key receives the recorded response or status.

pub mod acl;
pub mod cache;
pub mod interceptor;
pub mod key;
pub mod outcome;
pub mod storage;

pub use acl::{Acl, ApplicabilityGate, CallContext, MethodAcl, ResultShape};
pub use cache::{CacheConfig, CacheStats, CacheStatsSnapshot, Execution, ResultCache};
pub use interceptor::{IdempotencyInterceptor, REPLAY_HEADER};
pub use key::{IdempotencyKey, KeyExtractor, KEY_HEADER, X_KEY_HEADER};
pub use outcome::{Outcome, StoredOutcome};
pub use storage::{
    build_storage, MemoryStorage, PostgresStorage, RedisStorage, Storage, StorageCleanupJob,
    StorageHandle, TieredStorage,
};
