//! End-to-end request lifecycle: dedup, cancellation, retry and the
//! run-only-once gate, observed through the store and the event history.

#![allow(clippy::unwrap_used)]

use composable_requests_core::{RequestError, RequestStatus};
use composable_requests_runtime::RequestConfig;
use composable_requests_testing::TestHarness;
use composable_requests_testing::mocks::ScriptedOperation;
use std::time::Duration;
use tokio_test::assert_pending;

use RequestStatus::{Canceled, Pending, Rejected, Resolved};

const SHORT: Duration = Duration::from_millis(50);

#[tokio::test]
async fn test_duplicate_dispatch_runs_operation_once() {
    let harness = TestHarness::new();
    let op = ScriptedOperation::resolving("payload").with_delay(Duration::from_millis(200));

    let first = harness.dispatch(op.descriptor("R")).unwrap();
    let second = harness.dispatch(op.descriptor("R")).unwrap();

    let (a, b) = tokio::join!(first.result(), second.result());
    assert_eq!(a.unwrap(), "payload");
    assert_eq!(b.unwrap(), "payload");
    assert_eq!(op.calls(), 1);
    assert_eq!(harness.history("R"), vec![Pending, Resolved]);
    assert!(harness.status("R").is_resolved);

    // Terminal, so the next dispatch starts fresh.
    let third = harness.dispatch(op.descriptor("R")).unwrap();
    assert!(harness.status("R").is_pending);
    third.await.unwrap();
    assert_eq!(op.calls(), 2);
}

#[tokio::test]
async fn test_independent_identifiers_resolve_concurrently() {
    let harness = TestHarness::new();
    let ops: Vec<_> = (0..3_u32)
        .map(|n| ScriptedOperation::resolving(n).with_delay(SHORT))
        .collect();

    let handles: Vec<_> = ops
        .iter()
        .enumerate()
        .map(|(n, op)| harness.dispatch(op.descriptor(&format!("id-{n}"))).unwrap())
        .collect();

    let started = tokio::time::Instant::now();
    let values = futures::future::join_all(handles.iter().map(|h| h.result())).await;
    assert!(started.elapsed() < SHORT * 3);

    let values: Vec<u32> = values.into_iter().map(Result::unwrap).collect();
    assert_eq!(values, vec![0, 1, 2]);
    for n in 0..3 {
        assert!(harness.status(&format!("id-{n}")).is_resolved);
    }
}

#[tokio::test]
async fn test_pending_is_visible_as_soon_as_dispatch_returns() {
    let harness = TestHarness::new();
    let op = ScriptedOperation::resolving(()).with_delay(SHORT);

    assert_eq!(harness.status("visible").status, None);
    let _handle = harness.dispatch(op.descriptor("visible")).unwrap();

    let view = harness.status("visible");
    assert!(view.is_pending);
    assert!(!view.is_resolved && !view.is_rejected && !view.is_canceled);
}

#[tokio::test]
async fn test_failure_rejects_result_and_records_rejected() {
    let harness = TestHarness::new();
    let op = ScriptedOperation::<u8>::rejecting("backend unavailable");

    let outcome = harness.dispatch(op.descriptor("broken")).unwrap().await;
    let error = outcome.unwrap_err();
    assert!(matches!(error, RequestError::OperationFailed { .. }));
    assert_eq!(error.cause().unwrap().to_string(), "backend unavailable");
    assert_eq!(harness.history("broken"), vec![Pending, Rejected]);
    assert!(!harness.middleware().is_active("broken"));
}

#[tokio::test]
async fn test_cancel_twice_emits_one_canceled_event() {
    let harness = TestHarness::new();
    let op = ScriptedOperation::resolving(1_u8).with_delay(SHORT);
    let handle = harness.dispatch(op.descriptor("twice")).unwrap();

    handle.cancel();
    handle.cancel();

    assert!(handle.is_canceled());
    assert_eq!(harness.history("twice"), vec![Pending, Canceled]);
}

#[tokio::test]
async fn test_canceled_result_never_settles() {
    let harness = TestHarness::new();
    let op = ScriptedOperation::resolving(1_u8).with_delay(SHORT);
    let handle = harness.dispatch(op.descriptor("silent")).unwrap();
    handle.cancel();

    tokio::time::sleep(SHORT * 2).await;
    assert_eq!(op.completed(), 1);

    let mut result = tokio_test::task::spawn(handle.result());
    assert_pending!(result.poll());
}

#[tokio::test]
async fn test_cancel_leaves_side_effect_unobserved() {
    let harness = TestHarness::new();
    let op = ScriptedOperation::resolving("late").with_delay(Duration::from_millis(200));
    let handle = harness.dispatch(op.descriptor("cancel-me")).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();
    assert!(harness.status("cancel-me").is_canceled);

    tokio::time::sleep(Duration::from_millis(200)).await;
    // The operation ran to the end, but nobody saw it.
    assert_eq!(op.completed(), 1);
    assert!(harness.status("cancel-me").is_canceled);
    assert_eq!(harness.history("cancel-me"), vec![Pending, Canceled]);
    assert!(
        tokio::time::timeout(SHORT, handle.result())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_canceled_identifier_is_free_immediately() {
    let harness = TestHarness::new();
    let op = ScriptedOperation::resolving(5_u16).with_delay(Duration::from_millis(100));

    let first = harness.dispatch(op.descriptor("reuse")).unwrap();
    first.cancel();
    assert!(!harness.middleware().is_active("reuse"));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = harness.dispatch(op.descriptor("reuse")).unwrap();
    assert_eq!(op.calls(), 2);
    assert_ne!(first.generation(), second.generation());

    assert_eq!(second.await.unwrap(), 5);
    // The first operation finished in between without touching the successor.
    assert_eq!(op.completed(), 2);
    assert_eq!(harness.history("reuse"), vec![Pending, Canceled, Pending, Resolved]);
}

#[tokio::test]
async fn test_cancel_after_completion_keeps_completed_status() {
    let harness = TestHarness::new();
    let op = ScriptedOperation::resolving(9_i32);
    let handle = harness.dispatch(op.descriptor("done")).unwrap();

    assert_eq!(handle.clone().await.unwrap(), 9);
    handle.cancel();

    assert!(handle.is_settled());
    assert!(!handle.is_canceled());
    assert!(harness.status("done").is_resolved);
    assert_eq!(harness.history("done"), vec![Pending, Resolved]);
}

#[tokio::test]
async fn test_abort_on_cancel_stops_the_operation() {
    let harness = TestHarness::with_config(RequestConfig::default().with_abort_on_cancel(true));
    let op = ScriptedOperation::resolving(()).with_delay(SHORT);
    let handle = harness.dispatch(op.descriptor("abort")).unwrap();

    handle.cancel();
    tokio::time::sleep(SHORT * 2).await;

    assert_eq!(op.calls(), 1);
    assert_eq!(op.completed(), 0);
    assert_eq!(harness.history("abort"), vec![Pending, Canceled]);
}

#[tokio::test]
async fn test_serial_duplicates_only_start_after_settle() {
    let harness = TestHarness::new();
    let op = ScriptedOperation::resolving(1_u64).with_delay(SHORT);

    let first = harness.dispatch(op.descriptor("serial")).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = harness.dispatch(op.descriptor("serial")).unwrap();
    assert_eq!(first.generation(), second.generation());
    assert_eq!(op.calls(), 1);

    second.await.unwrap();
    first.await.unwrap();

    let third = harness.dispatch(op.descriptor("serial")).unwrap();
    assert_eq!(op.calls(), 2);
    third.await.unwrap();
}

#[tokio::test]
async fn test_retry_after_rejection_then_concurrent_retries_collapse() {
    let harness = TestHarness::new();
    let op = ScriptedOperation::rejecting("try 1")
        .then_reject("try 2")
        .then_resolve("ok")
        .with_delay(SHORT);

    let first = harness.dispatch(op.descriptor("flaky")).unwrap();
    assert!(first.clone().await.is_err());
    assert_eq!(op.calls(), 1);

    let second = first.retry().unwrap();
    assert!(second.clone().await.is_err());
    assert_eq!(op.calls(), 2);

    let retries: Vec<_> = (0..5).map(|_| second.retry().unwrap()).collect();
    assert_eq!(op.calls(), 3);
    assert!(retries.iter().all(|r| r.generation() == retries[0].generation()));

    for retry in retries {
        assert_eq!(retry.await.unwrap(), "ok");
    }
    assert_eq!(
        harness.history("flaky"),
        vec![Pending, Rejected, Pending, Rejected, Pending, Resolved]
    );
}

#[tokio::test]
async fn test_run_only_once_discards_after_resolution() {
    let harness = TestHarness::new();
    let op = ScriptedOperation::rejecting("not yet").then_resolve(42_u32);
    let once = || op.descriptor("X").run_only_once(true);

    assert!(harness.dispatch(once()).unwrap().await.is_err());
    assert!(harness.status("X").is_rejected);

    assert_eq!(harness.dispatch(once()).unwrap().await.unwrap(), 42);
    assert!(harness.status("X").is_resolved);
    let _ = harness.drain_forwarded().await;

    let third = harness.dispatch(once()).unwrap();
    assert!(third.is_discarded());
    assert!(matches!(third.await, Err(RequestError::Discarded { .. })));

    assert_eq!(op.calls(), 2);
    assert_eq!(harness.history("X"), vec![Pending, Rejected, Pending, Resolved]);
    assert!(harness.drain_forwarded().await.is_empty());
}

#[tokio::test]
async fn test_run_only_once_while_pending_deduplicates() {
    let harness = TestHarness::new();
    let op = ScriptedOperation::resolving(1_u8).with_delay(SHORT);

    let first = harness.dispatch(op.descriptor("gate").run_only_once(true)).unwrap();
    let second = harness.dispatch(op.descriptor("gate").run_only_once(true)).unwrap();

    assert!(!second.is_discarded());
    assert_eq!(first.generation(), second.generation());
    second.await.unwrap();
    assert_eq!(op.calls(), 1);
}

#[tokio::test]
async fn test_fresh_and_deduplicated_dispatches_are_forwarded() {
    let harness = TestHarness::new();
    let op = ScriptedOperation::resolving(3_u8).with_delay(SHORT);

    let _first = harness.dispatch(op.descriptor("fwd")).unwrap();
    let _second = harness.dispatch(op.descriptor("fwd")).unwrap();

    let forwarded = harness.next_forwarded().await.unwrap();
    assert_eq!(forwarded.id.as_str(), "fwd");
    assert!(!forwarded.deduplicated);
    assert!(forwarded.settled.await.is_ok());

    let deduplicated = harness.next_forwarded().await.unwrap();
    assert!(deduplicated.deduplicated);
}

#[tokio::test]
async fn test_retry_on_active_handle_is_absorbed() {
    let harness = TestHarness::new();
    let op = ScriptedOperation::resolving(8_u8).with_delay(SHORT);

    let handle = harness.dispatch(op.descriptor("busy")).unwrap();
    let retried = handle.retry().unwrap();

    assert_eq!(handle.generation(), retried.generation());
    assert_eq!(retried.await.unwrap(), 8);
    assert_eq!(op.calls(), 1);
}
