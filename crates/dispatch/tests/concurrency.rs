//! Concurrent sends, identifier locking and pool pressure.

mod common;

use std::time::Duration;

use common::{Harness, message, pool_config};
use futures::future::join_all;
use herald_dispatch::testing::{BrokerOp, Fault, StoreOp};
use herald_dispatch::{FailureReason, Outcome};
use herald_pool::{Context, ErrorKind};
use pretty_assertions::assert_eq;

async fn race_same_identifier(h: &Harness, senders: usize) -> Vec<Outcome> {
    h.broker
        .set_fault(BrokerOp::Publish, Fault::Stall(Duration::from_millis(10)));
    let sends = (0..senders).map(|_| {
        let dispatcher = h.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .send(&Context::new(), &message("same", "x"))
                .await
        })
    });
    join_all(sends)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn unlocked_sends_of_one_identifier_can_both_publish() {
    let h = Harness::new();

    let outcomes = race_same_identifier(&h, 2).await;

    assert!(outcomes.iter().all(Outcome::is_sent));
    assert_eq!(h.broker.calls(BrokerOp::Publish), 2);
}

#[tokio::test(start_paused = true)]
async fn identifier_locking_serializes_same_identifier() {
    let h = Harness::build(pool_config(4), |d| d.with_identifier_locking(8));

    let outcomes = race_same_identifier(&h, 3).await;

    assert_eq!(outcomes.iter().filter(|o| o.is_sent()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_skipped()).count(), 2);
    assert_eq!(h.broker.published_keys(), vec!["same"]);
}

#[tokio::test(start_paused = true)]
async fn distinct_identifiers_run_in_parallel() {
    let h = Harness::build(pool_config(4), |d| d.with_identifier_locking(64));
    h.broker
        .set_fault(BrokerOp::Publish, Fault::Stall(Duration::from_millis(100)));

    let started = tokio::time::Instant::now();
    let sends = ["a", "b", "c", "d"].map(|id| {
        let dispatcher = h.dispatcher.clone();
        tokio::spawn(async move { dispatcher.send(&Context::new(), &message(id, "x")).await })
    });
    for joined in join_all(sends).await {
        assert!(joined.unwrap().is_sent());
    }

    // Shards may collide; four serialized publishes would take 400ms.
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(h.store.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn exhausted_pool_is_store_unavailable() {
    let h = Harness::with_pool(pool_config(1));
    let ctx = Context::new();
    let held = h.dispatcher.store().pool().acquire(&ctx).await.unwrap();

    let outcome = h.dispatcher.send(&ctx, &message("a", "x")).await;

    let Outcome::Failed(err) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(err.reason(), FailureReason::StoreUnavailable);
    assert_eq!(err.pool_error().map(|e| e.kind()), Some(ErrorKind::PoolExhausted));
    assert_eq!(h.broker.calls(BrokerOp::Publish), 0);

    held.release();
    assert!(h.dispatcher.send(&ctx, &message("a", "x")).await.is_sent());
}

#[tokio::test]
async fn connect_failure_is_creation_failure() {
    let h = Harness::new();
    h.store.set_fault(StoreOp::Connect, Fault::Fail);

    let outcome = h.dispatcher.send(&Context::new(), &message("a", "x")).await;

    let Outcome::Failed(err) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(
        err.pool_error().map(|e| e.kind()),
        Some(ErrorKind::ResourceCreationFailed)
    );
    assert_eq!(h.dispatcher.stats().size, 0);
}

#[tokio::test(start_paused = true)]
async fn many_senders_share_a_small_pool() {
    let h = Harness::build(
        pool_config(2).with_acquire_timeout(Some(Duration::from_secs(5))),
        |d| d,
    );
    h.store
        .set_fault(StoreOp::Get, Fault::Stall(Duration::from_millis(5)));

    let sends = (0..20).map(|i| {
        let dispatcher = h.dispatcher.clone();
        tokio::spawn(async move {
            let msg = herald_dispatch::Message::with_identifier(format!("m{i}"), "x").unwrap();
            dispatcher.send(&Context::new(), &msg).await
        })
    });
    for joined in join_all(sends).await {
        assert!(joined.unwrap().is_sent());
    }

    let stats = h.dispatcher.stats();
    assert!(stats.created <= 2, "created {} connections", stats.created);
    assert_eq!(stats.active, 0);
    assert_eq!(h.broker.published().len(), 20);
}
