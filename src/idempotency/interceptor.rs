use crate::config::IdempotencySettings;
use crate::idempotency::acl::{Acl, ApplicabilityGate, CallContext};
use crate::idempotency::cache::{CacheConfig, CacheStats, Execution, ResultCache};
use crate::idempotency::key::KeyExtractor;
use crate::idempotency::storage::Storage;
use crate::observability::get_metrics;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Extensions, Request, Response, Status};
use tracing::Instrument;

/// Metadata attached to successful responses served from a recorded outcome.
pub const REPLAY_HEADER: &str = "x-idempotency-replay";

/// Server-side idempotency enforcement for unary calls.
///
/// Holds no per-call state and can be shared across tasks behind an `Arc`.
pub struct IdempotencyInterceptor {
    gate: ApplicabilityGate,
    extractor: KeyExtractor,
    cache: ResultCache,
}

impl IdempotencyInterceptor {
    pub fn new(gate: ApplicabilityGate, extractor: KeyExtractor, cache: ResultCache) -> Self {
        Self {
            gate,
            extractor,
            cache,
        }
    }

    pub fn from_settings(
        settings: &IdempotencySettings,
        storage: Arc<dyn Storage>,
        acl: Arc<dyn Acl>,
    ) -> Self {
        Self::new(
            ApplicabilityGate::new(acl),
            KeyExtractor::new(settings.max_key_length),
            ResultCache::new(storage, CacheConfig::from(settings)),
        )
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        self.cache.stats()
    }

    pub fn in_flight(&self) -> usize {
        self.cache.in_flight()
    }

    /// Runs `handler` for `request` under the idempotency policy for `method`
    /// (the fully-qualified `/pkg.Service/Method` path).
    ///
    /// Calls the policy does not cover go straight to the handler. Covered calls
    /// must carry a key; the handler then runs at most once per key and every
    /// later call receives the recorded response or status.
    pub async fn handle<Req, Resp, F, Fut>(
        &self,
        request: Request<Req>,
        method: &str,
        handler: F,
    ) -> Result<Response<Resp>, Status>
    where
        Resp: Serialize + DeserializeOwned,
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        let metrics = get_metrics();

        let ctx = CallContext::from_request(&request);
        let Some(shape) = self.gate.applies(&ctx, method).await? else {
            tracing::trace!(method = %method, "Idempotency not required; passing through");
            metrics.record_request(method, "passthrough");
            return handler(request).await;
        };

        let key = match self.extractor.extract(request.metadata()) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(method = %method, "Rejecting call without usable idempotency key: {}", e);
                metrics.record_request(method, "rejected");
                return Err(e.into());
            }
        };

        // Only the message is recorded; the executing caller keeps the handler's metadata.
        let mut handler_parts: Option<(MetadataMap, Extensions)> = None;
        let slot = &mut handler_parts;

        let span = tracing::debug_span!("idempotent_call", method = %method, key = %key.masked());
        let result = self
            .cache
            .execute_once(&key, &shape, || async move {
                let (metadata, message, extensions) = handler(request).await?.into_parts();
                *slot = Some((metadata, extensions));
                Ok::<_, Status>(message)
            })
            .instrument(span)
            .await;

        match result {
            Ok(Execution::Executed(message)) => {
                metrics.record_request(method, "executed");
                Ok(match handler_parts {
                    Some((metadata, extensions)) => Response::from_parts(metadata, message, extensions),
                    None => Response::new(message),
                })
            }
            Ok(Execution::Replayed(message)) => {
                metrics.record_request(method, "replayed");
                tracing::info!(method = %method, key = %key.masked(), "Served recorded response");
                let mut response = Response::new(message);
                response
                    .metadata_mut()
                    .insert(REPLAY_HEADER, MetadataValue::from_static("true"));
                Ok(response)
            }
            Err(status) => {
                metrics.record_request(method, "error");
                Err(status)
            }
        }
    }
}
