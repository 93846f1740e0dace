mod common;

use async_trait::async_trait;
use common::{call, memory_interceptor, request, Order, CANCEL_ORDER, CREATE_ORDER, GET_ORDER};
use mockall::mock;
use rpc_idempotency::config::{IdempotencySettings, InFlightPolicy};
use rpc_idempotency::error::{AppError, Result};
use rpc_idempotency::idempotency::{
    Acl, CallContext, IdempotencyInterceptor, IdempotencyKey, Outcome, ResultShape, Storage,
    StoredOutcome, REPLAY_HEADER,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio_test::{assert_err, assert_ok};
use tonic::metadata::MetadataValue;
use tonic::{Code, Response, Status};

mock! {
    pub Store {}

    #[async_trait]
    impl Storage for Store {
        async fn get(&self, key: &IdempotencyKey) -> Result<Option<StoredOutcome>>;
        async fn set(&self, key: &IdempotencyKey, entry: &StoredOutcome) -> Result<()>;
        async fn insert_if_absent(
            &self,
            key: &IdempotencyKey,
            entry: &StoredOutcome,
        ) -> Result<Option<StoredOutcome>>;
    }
}

struct DenyAll;

#[async_trait]
impl Acl for DenyAll {
    async fn check(&self, _ctx: &CallContext<'_>, _method: &str) -> std::result::Result<Option<ResultShape>, Status> {
        Err(Status::permission_denied("caller may not invoke this method"))
    }
}

fn is_replay(response: &Response<Order>) -> bool {
    response.metadata().get(REPLAY_HEADER).is_some()
}

#[tokio::test]
async fn test_repeated_calls_run_handler_once() {
    let (interceptor, _) = memory_interceptor(IdempotencySettings::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let first = assert_ok!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "k-1")]), &calls, Ok(Order { id: 1 })).await
    );
    let second = assert_ok!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "k-1")]), &calls, Ok(Order { id: 2 })).await
    );
    let third = assert_ok!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "k-1")]), &calls, Ok(Order { id: 3 })).await
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!is_replay(&first));
    assert!(is_replay(&second));
    assert!(is_replay(&third));
    assert_eq!(first.into_inner(), Order { id: 1 });
    assert_eq!(second.into_inner(), Order { id: 1 });
    assert_eq!(third.into_inner(), Order { id: 1 });
}

#[tokio::test]
async fn test_uncovered_method_passes_through() {
    let (interceptor, storage) = memory_interceptor(IdempotencySettings::default());
    let calls = Arc::new(AtomicUsize::new(0));

    // No key required, and a supplied key is ignored.
    let first = assert_ok!(call(&interceptor, GET_ORDER, request(&[]), &calls, Ok(Order { id: 1 })).await);
    let second = assert_ok!(
        call(&interceptor, GET_ORDER, request(&[("idempotency-key", "k-1")]), &calls, Ok(Order { id: 2 })).await
    );

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(first.into_inner(), Order { id: 1 });
    assert!(!is_replay(&second));
    assert_eq!(second.into_inner(), Order { id: 2 });
    assert!(storage.is_empty().await);
}

#[tokio::test]
async fn test_uncovered_method_returns_handler_error_unmodified() {
    let (interceptor, storage) = memory_interceptor(IdempotencySettings::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let status = assert_err!(
        call(&interceptor, GET_ORDER, request(&[]), &calls, Err(Status::not_found("order 9"))).await
    );
    assert_eq!(status.code(), Code::NotFound);
    assert_eq!(status.message(), "order 9");
    assert!(storage.is_empty().await);
}

#[tokio::test]
async fn test_primary_header_takes_precedence() {
    let (interceptor, _) = memory_interceptor(IdempotencySettings::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let both = request(&[("idempotency-key", "key-a"), ("x-idempotency-key", "key-b")]);
    assert_ok!(call(&interceptor, CREATE_ORDER, both, &calls, Ok(Order { id: 1 })).await);

    // Recorded under the primary header's value.
    let replayed = assert_ok!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "key-a")]), &calls, Ok(Order { id: 2 })).await
    );
    assert!(is_replay(&replayed));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The alias value was never used as a key.
    let fresh = assert_ok!(
        call(&interceptor, CREATE_ORDER, request(&[("x-idempotency-key", "key-b")]), &calls, Ok(Order { id: 3 })).await
    );
    assert!(!is_replay(&fresh));
    assert_eq!(fresh.into_inner(), Order { id: 3 });
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_alias_header_is_accepted() {
    let (interceptor, _) = memory_interceptor(IdempotencySettings::default());
    let calls = Arc::new(AtomicUsize::new(0));

    assert_ok!(
        call(&interceptor, CREATE_ORDER, request(&[("x-idempotency-key", "alias")]), &calls, Ok(Order { id: 1 })).await
    );
    let replayed = assert_ok!(
        call(&interceptor, CREATE_ORDER, request(&[("x-idempotency-key", "alias")]), &calls, Ok(Order { id: 2 })).await
    );
    assert!(is_replay(&replayed));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_or_empty_key_is_rejected() {
    let (interceptor, storage) = memory_interceptor(IdempotencySettings::default());
    let calls = Arc::new(AtomicUsize::new(0));

    for headers in [
        vec![],
        vec![("idempotency-key", "")],
        vec![("idempotency-key", "  "), ("x-idempotency-key", "")],
    ] {
        let status = assert_err!(
            call(&interceptor, CREATE_ORDER, request(&headers), &calls, Ok(Order { id: 1 })).await
        );
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("Idempotency-Key"));
        assert!(status.message().contains("X-Idempotency-Key"));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(storage.is_empty().await);
}

#[tokio::test]
async fn test_overlong_key_is_rejected() {
    let settings = IdempotencySettings {
        max_key_length: 8,
        ..IdempotencySettings::default()
    };
    let (interceptor, _) = memory_interceptor(settings);
    let calls = Arc::new(AtomicUsize::new(0));

    let status = assert_err!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "123456789")]), &calls, Ok(Order { id: 1 })).await
    );
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_handler_failure_is_replayed() {
    let (interceptor, _) = memory_interceptor(IdempotencySettings::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let first = assert_err!(
        call(
            &interceptor,
            CREATE_ORDER,
            request(&[("idempotency-key", "k-fail")]),
            &calls,
            Err(Status::failed_precondition("insufficient funds")),
        )
        .await
    );
    let second = assert_err!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "k-fail")]), &calls, Ok(Order { id: 1 })).await
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.code(), Code::FailedPrecondition);
    assert_eq!(second.code(), first.code());
    assert_eq!(second.message(), first.message());
}

#[tokio::test]
async fn test_cancelled_handler_leaves_key_retryable() {
    let (interceptor, storage) = memory_interceptor(IdempotencySettings::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let status = assert_err!(
        call(
            &interceptor,
            CREATE_ORDER,
            request(&[("idempotency-key", "k-cancel")]),
            &calls,
            Err(Status::cancelled("client went away")),
        )
        .await
    );
    assert_eq!(status.code(), Code::Cancelled);
    assert!(storage.is_empty().await);

    let retried = assert_ok!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "k-cancel")]), &calls, Ok(Order { id: 5 })).await
    );
    assert!(!is_replay(&retried));
    assert_eq!(retried.into_inner(), Order { id: 5 });
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_recorded_scenario_abc123() {
    let (interceptor, storage) = memory_interceptor(IdempotencySettings::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let first = assert_ok!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "abc123")]), &calls, Ok(Order { id: 7 })).await
    );
    assert_eq!(first.into_inner(), Order { id: 7 });

    let key = IdempotencyKey::new("abc123").unwrap();
    let stored = storage.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.outcome, Outcome::Success { payload: json!({ "id": 7 }) });
    assert_eq!(stored.shape, ResultShape::named("orders.v1.Order"));

    let second = assert_ok!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "abc123")]), &calls, Ok(Order { id: 8 })).await
    );
    assert_eq!(second.into_inner(), Order { id: 7 });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_key_reused_on_other_method_is_rejected() {
    let (interceptor, _) = memory_interceptor(IdempotencySettings::default());
    let calls = Arc::new(AtomicUsize::new(0));

    assert_ok!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "shared")]), &calls, Ok(Order { id: 1 })).await
    );
    let status = assert_err!(
        call(&interceptor, CANCEL_ORDER, request(&[("idempotency-key", "shared")]), &calls, Ok(Order { id: 2 })).await
    );

    assert_eq!(status.code(), Code::FailedPrecondition);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_first_execution_keeps_handler_metadata() {
    let (interceptor, _) = memory_interceptor(IdempotencySettings::default());

    let mut responses = Vec::new();
    for id in [1, 2] {
        let response = interceptor
            .handle(request(&[("idempotency-key", "traced")]), CREATE_ORDER, |_req| async move {
                let mut response = Response::new(Order { id });
                response.metadata_mut().insert("x-trace", MetadataValue::from_static("abc"));
                response.extensions_mut().insert(id);
                Ok(response)
            })
            .await;
        responses.push(assert_ok!(response));
    }

    let first = &responses[0];
    assert!(!is_replay(first));
    assert_eq!(first.metadata().get("x-trace").unwrap().to_str().unwrap(), "abc");
    assert_eq!(first.extensions().get::<u64>(), Some(&1));
    assert_eq!(first.get_ref(), &Order { id: 1 });

    let second = &responses[1];
    assert!(is_replay(second));
    assert!(second.metadata().get("x-trace").is_none());
    assert!(second.extensions().get::<u64>().is_none());
    assert_eq!(second.get_ref(), &Order { id: 1 });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_execute_once() {
    const CALLERS: usize = 8;

    let (interceptor, _) = memory_interceptor(IdempotencySettings::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let tasks: Vec<_> = (0..CALLERS)
        .map(|i| {
            let interceptor = interceptor.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                interceptor
                    .handle(request(&[("idempotency-key", "burst")]), CREATE_ORDER, |_req| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Response::new(Order { id: i as u64 }))
                    })
                    .await
            })
        })
        .collect();

    let mut orders = Vec::with_capacity(CALLERS);
    let mut executed = 0;
    for task in tasks {
        let response = task.await.unwrap().unwrap();
        if !is_replay(&response) {
            executed += 1;
        }
        orders.push(response.into_inner());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(executed, 1);
    assert!(orders.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(interceptor.in_flight(), 0);

    let stats = interceptor.stats().snapshot();
    assert_eq!(stats.executions, 1);
    assert_eq!(stats.replays, (CALLERS - 1) as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_share_failure() {
    const CALLERS: usize = 6;

    let (interceptor, _) = memory_interceptor(IdempotencySettings::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let tasks: Vec<_> = (0..CALLERS)
        .map(|_| {
            let interceptor = interceptor.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                interceptor
                    .handle(request(&[("idempotency-key", "burst-fail")]), CREATE_ORDER, |_req| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<Response<Order>, _>(Status::failed_precondition("stock exhausted"))
                    })
                    .await
            })
        })
        .collect();

    let mut statuses = Vec::with_capacity(CALLERS);
    for task in tasks {
        let status = assert_err!(task.await.unwrap());
        statuses.push((status.code(), status.message().to_string()));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(statuses
        .iter()
        .all(|s| *s == (Code::FailedPrecondition, "stock exhausted".to_string())));
    assert_eq!(interceptor.in_flight(), 0);

    let stats = interceptor.stats().snapshot();
    assert_eq!(stats.executions, 1);
    assert_eq!(stats.replays, (CALLERS - 1) as u64);
}

#[tokio::test]
async fn test_wait_timeout_answers_aborted() {
    let settings = IdempotencySettings {
        in_flight_wait_ms: 50,
        ..IdempotencySettings::default()
    };
    let (interceptor, _) = memory_interceptor(settings);
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let leader = {
        let interceptor = interceptor.clone();
        tokio::spawn(async move {
            interceptor
                .handle(request(&[("idempotency-key", "slow")]), CREATE_ORDER, |_req| async move {
                    release_rx.await.ok();
                    Ok(Response::new(Order { id: 1 }))
                })
                .await
        })
    };
    while interceptor.in_flight() == 0 {
        tokio::task::yield_now().await;
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let status = assert_err!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "slow")]), &calls, Ok(Order { id: 2 })).await
    );
    assert_eq!(status.code(), Code::Aborted);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    release_tx.send(()).unwrap();
    let response = assert_ok!(leader.await.unwrap());
    assert_eq!(response.into_inner(), Order { id: 1 });
    assert_eq!(interceptor.in_flight(), 0);
}

#[tokio::test]
async fn test_reject_policy_answers_aborted() {
    let settings = IdempotencySettings {
        in_flight_policy: InFlightPolicy::Reject,
        ..IdempotencySettings::default()
    };
    let (interceptor, _) = memory_interceptor(settings);
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let leader = {
        let interceptor = interceptor.clone();
        tokio::spawn(async move {
            interceptor
                .handle(request(&[("idempotency-key", "busy")]), CREATE_ORDER, |_req| async move {
                    release_rx.await.ok();
                    Ok(Response::new(Order { id: 1 }))
                })
                .await
        })
    };
    while interceptor.in_flight() == 0 {
        tokio::task::yield_now().await;
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let status = assert_err!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "busy")]), &calls, Ok(Order { id: 2 })).await
    );
    assert_eq!(status.code(), Code::Aborted);

    release_tx.send(()).unwrap();
    assert_ok!(leader.await.unwrap());

    // Once recorded, duplicates replay instead of being rejected.
    let replayed = assert_ok!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "busy")]), &calls, Ok(Order { id: 3 })).await
    );
    assert_eq!(replayed.into_inner(), Order { id: 1 });
    assert_eq!(interceptor.stats().snapshot().rejected, 1);
}

#[tokio::test]
async fn test_storage_read_failure_is_not_a_miss() {
    let mut store = MockStore::new();
    store
        .expect_get()
        .times(1)
        .returning(|_| Err(AppError::Storage("connection reset".to_string())));
    store.expect_insert_if_absent().never();

    let interceptor = IdempotencyInterceptor::from_settings(
        &IdempotencySettings::default(),
        Arc::new(store),
        Arc::new(common::order_acl()),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let status = assert_err!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "k-1")]), &calls, Ok(Order { id: 1 })).await
    );

    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "idempotency storage failure");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(interceptor.stats().snapshot().storage_errors, 1);
}

#[tokio::test]
async fn test_storage_write_failure_is_reported() {
    let mut store = MockStore::new();
    store.expect_get().times(2).returning(|_| Ok(None));
    store
        .expect_insert_if_absent()
        .times(1)
        .returning(|_, _| Err(AppError::Storage("disk full".to_string())));

    let interceptor = IdempotencyInterceptor::from_settings(
        &IdempotencySettings::default(),
        Arc::new(store),
        Arc::new(common::order_acl()),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let status = assert_err!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "k-1")]), &calls, Ok(Order { id: 1 })).await
    );

    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "idempotency storage failure");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(interceptor.in_flight(), 0);
}

#[tokio::test]
async fn test_losing_writer_replays_winner() {
    let winner = StoredOutcome::new(
        ResultShape::named("orders.v1.Order"),
        Outcome::Success { payload: json!({ "id": 42 }) },
    );

    let mut store = MockStore::new();
    store.expect_get().times(2).returning(|_| Ok(None));
    store
        .expect_insert_if_absent()
        .times(1)
        .returning(move |_, _| Ok(Some(winner.clone())));

    let interceptor = IdempotencyInterceptor::from_settings(
        &IdempotencySettings::default(),
        Arc::new(store),
        Arc::new(common::order_acl()),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let response = assert_ok!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "k-1")]), &calls, Ok(Order { id: 1 })).await
    );
    assert!(is_replay(&response));
    assert_eq!(response.into_inner(), Order { id: 42 });
}

#[tokio::test]
async fn test_policy_error_is_returned_untouched() {
    let storage = Arc::new(rpc_idempotency::idempotency::MemoryStorage::default());
    let interceptor =
        IdempotencyInterceptor::from_settings(&IdempotencySettings::default(), storage, Arc::new(DenyAll));
    let calls = Arc::new(AtomicUsize::new(0));

    let status = assert_err!(
        call(&interceptor, CREATE_ORDER, request(&[("idempotency-key", "k-1")]), &calls, Ok(Order { id: 1 })).await
    );

    assert_eq!(status.code(), Code::PermissionDenied);
    assert_eq!(status.message(), "caller may not invoke this method");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
