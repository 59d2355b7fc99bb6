//! Cancelling an acquire must not leak slots or waiters.

mod common;

use std::time::Duration;

use common::{Fake, config, init_tracing};
use herald_pool::{Context, ErrorKind, Pool};
use pretty_assertions::assert_eq;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn cancel_mid_wait_does_not_leak() {
    init_tracing();
    let cfg = config(1).with_acquire_timeout(Some(Duration::from_secs(30)));
    let pool = Pool::new(Fake::new(), cfg).unwrap();
    let held = pool.acquire(&Context::new()).await.unwrap();

    let token = CancellationToken::new();
    let waiter = {
        let pool = pool.clone();
        let ctx = Context::new().with_cancellation(token.clone());
        tokio::spawn(async move { pool.acquire(&ctx).await.map(|l| l.serial) })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.stats().waiting, 1);

    token.cancel();
    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(pool.stats().waiting, 0);

    drop(held);
    let lease = pool.acquire(&Context::new()).await.unwrap();
    assert_eq!(lease.serial, 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_acquire_future_releases_waiter_count() {
    let cfg = config(1).with_acquire_timeout(None);
    let pool = Pool::new(Fake::new(), cfg).unwrap();
    let _held = pool.acquire(&Context::new()).await.unwrap();

    let ctx = Context::new();
    let outcome = tokio::time::timeout(Duration::from_millis(20), pool.acquire(&ctx)).await;
    assert!(outcome.is_err());
    assert_eq!(pool.stats().waiting, 0);
}

#[tokio::test(start_paused = true)]
async fn context_deadline_shortens_acquire_timeout() {
    let cfg = config(1).with_acquire_timeout(Some(Duration::from_secs(10)));
    let pool = Pool::new(Fake::new(), cfg).unwrap();
    let _held = pool.acquire(&Context::new()).await.unwrap();

    let started = Instant::now();
    let ctx = Context::new().with_timeout(Duration::from_millis(100));
    let err = pool.acquire(&ctx).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    assert_eq!(started.elapsed(), Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn cancel_during_creation_frees_slot() {
    let fake = Fake::new();
    fake.set_create_delay(Duration::from_secs(5));
    let cfg = config(1).with_acquire_timeout(None);
    let pool = Pool::new(fake.clone(), cfg).unwrap();

    let token = CancellationToken::new();
    let attempt = {
        let pool = pool.clone();
        let ctx = Context::new().with_cancellation(token.clone());
        tokio::spawn(async move { pool.acquire(&ctx).await.map(|l| l.serial) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.stats().size, 1);

    token.cancel();
    let err = attempt.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(pool.stats().size, 0);
    assert_eq!(pool.stats().created, 0);
}

#[tokio::test]
async fn already_cancelled_context_fails_fast() {
    let fake = Fake::new();
    let pool = Pool::new(fake.clone(), config(1)).unwrap();
    let ctx = Context::new();
    ctx.cancellation().cancel();

    let err = pool.acquire(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(fake.creates(), 0);
}
