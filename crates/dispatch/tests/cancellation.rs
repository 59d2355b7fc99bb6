//! Cancellation and deadlines at each stage of a send.

mod common;

use std::time::Duration;

use common::{Harness, message};
use herald_dispatch::testing::{BrokerOp, Fault, StoreOp};
use herald_dispatch::{DispatchError, FailureReason, Outcome, Stage, StoreError};
use herald_pool::{Context, Interrupted};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn cancel_during_publish_records_nothing() {
    let h = Harness::new();
    h.broker
        .set_fault(BrokerOp::Publish, Fault::Stall(Duration::from_secs(60)));
    let token = CancellationToken::new();
    let ctx = Context::new().with_cancellation(token.clone());

    let dispatcher = h.dispatcher.clone();
    let send = tokio::spawn(async move { dispatcher.send(&ctx, &message("a", "x")).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    token.cancel();

    let outcome = send.await.unwrap();
    let Outcome::Failed(DispatchError::Cancelled { stage, reason, .. }) = outcome else {
        panic!("expected cancellation, got {outcome:?}");
    };
    assert_eq!(stage, Stage::Publish);
    assert_eq!(reason, Interrupted::Cancelled);
    assert_eq!(h.store.calls(StoreOp::Set), 0);
    assert!(h.broker.published().is_empty());
    assert_eq!(h.dispatcher.stats().active, 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_record_is_unrecorded_send() {
    let h = Harness::new();
    h.store
        .set_fault(StoreOp::Set, Fault::Stall(Duration::from_secs(60)));
    let token = CancellationToken::new();
    let ctx = Context::new().with_cancellation(token.clone());

    let dispatcher = h.dispatcher.clone();
    let send = tokio::spawn(async move { dispatcher.send(&ctx, &message("a", "x")).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    token.cancel();

    let Outcome::Failed(err) = send.await.unwrap() else {
        panic!("expected failure");
    };
    assert_eq!(err.reason(), FailureReason::SentButUnrecorded);
    assert!(matches!(
        err,
        DispatchError::SentButUnrecorded {
            source: StoreError::Interrupted { .. },
            ..
        }
    ));
    assert_eq!(h.broker.published_keys(), vec!["a"]);

    // The interrupted connection is not reused.
    let stats = h.dispatcher.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.destroyed, 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_during_check_never_publishes() {
    let h = Harness::new();
    h.store
        .set_fault(StoreOp::Get, Fault::Stall(Duration::from_secs(60)));
    let ctx = Context::new().with_timeout(Duration::from_millis(100));

    let outcome = h.dispatcher.send(&ctx, &message("a", "x")).await;

    let Outcome::Failed(DispatchError::Cancelled { stage, reason, .. }) = outcome else {
        panic!("expected cancellation, got {outcome:?}");
    };
    assert_eq!(stage, Stage::Check);
    assert_eq!(reason, Interrupted::DeadlineExceeded);
    assert_eq!(h.broker.calls(BrokerOp::Publish), 0);
    assert_eq!(h.dispatcher.stats().active, 0);
}

#[tokio::test]
async fn cancelled_context_fails_before_any_io() {
    let h = Harness::new();
    let ctx = Context::new();
    ctx.cancellation().cancel();

    let outcome = h.dispatcher.send(&ctx, &message("a", "x")).await;

    assert_eq!(outcome.failure_reason(), Some(FailureReason::Cancelled));
    assert_eq!(h.store.calls(StoreOp::Get), 0);
    assert_eq!(h.broker.calls(BrokerOp::Publish), 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_a_send_returns_its_lease() {
    let h = Harness::new();
    h.store
        .set_fault(StoreOp::Get, Fault::Stall(Duration::from_secs(60)));
    let ctx = Context::new();

    let dispatcher = h.dispatcher.clone();
    let send = tokio::spawn(async move { dispatcher.send(&ctx, &message("a", "x")).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.dispatcher.stats().active, 1);

    send.abort();
    assert!(send.await.unwrap_err().is_cancelled());
    assert_eq!(h.dispatcher.stats().active, 0);
}

#[tokio::test(start_paused = true)]
async fn store_operation_timeout_bounds_a_hung_check() {
    let h = Harness::new();
    let store = h
        .dispatcher
        .store()
        .clone()
        .with_operation_timeout(Some(Duration::from_millis(200)));
    h.store
        .set_fault(StoreOp::Get, Fault::Stall(Duration::from_secs(60)));

    let err = store.exists(&Context::new(), "a").await.unwrap_err();

    assert!(matches!(
        err,
        StoreError::Interrupted {
            reason: Interrupted::DeadlineExceeded,
            ..
        }
    ));
    assert_eq!(store.stats().active, 0);
}
