//! Shared fixtures for pool integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Once;
use std::time::Duration;

use herald_pool::{Context, PoolConfig, Resource};
use parking_lot::Mutex;

static TRACING: Once = Once::new();

/// Route pool logs through the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FakeError(pub &'static str);

/// A pooled "connection". `serial` is assigned by the fake at creation.
#[derive(Debug)]
pub struct FakeConn {
    pub serial: u64,
    pub broken: bool,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub creates: AtomicU64,
    pub validations: AtomicU64,
    pub cleanups: AtomicU64,
    pub fail_create: AtomicBool,
    /// Serials that fail their next liveness check
    pub stale: Mutex<HashSet<u64>>,
    pub create_delay: Mutex<Option<Duration>>,
    pub validate_delay: Mutex<Option<Duration>>,
}

/// Resource whose behavior tests can flip at runtime through the shared
/// [`FakeState`].
#[derive(Debug, Clone, Default)]
pub struct Fake {
    pub state: Arc<FakeState>,
}

impl Fake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let fake = Self::default();
        fake.state.fail_create.store(true, Ordering::SeqCst);
        fake
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.state.create_delay.lock() = Some(delay);
    }

    pub fn set_validate_delay(&self, delay: Duration) {
        *self.state.validate_delay.lock() = Some(delay);
    }

    pub fn mark_stale(&self, serial: u64) {
        self.state.stale.lock().insert(serial);
    }

    pub fn creates(&self) -> u64 {
        self.state.creates.load(Ordering::SeqCst)
    }

    pub fn validations(&self) -> u64 {
        self.state.validations.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> u64 {
        self.state.cleanups.load(Ordering::SeqCst)
    }
}

impl Resource for Fake {
    type Instance = FakeConn;
    type Error = FakeError;

    fn id(&self) -> &str {
        "fake"
    }

    async fn create(&self, _ctx: &Context) -> Result<FakeConn, FakeError> {
        let serial = self.state.creates.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_create.load(Ordering::SeqCst) {
            return Err(FakeError("connection refused"));
        }
        Ok(FakeConn {
            serial,
            broken: false,
        })
    }

    async fn validate(&self, conn: &mut FakeConn, _ctx: &Context) -> Result<(), FakeError> {
        self.state.validations.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.validate_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.stale.lock().contains(&conn.serial) {
            return Err(FakeError("connection reset by peer"));
        }
        Ok(())
    }

    fn has_broken(&self, conn: &mut FakeConn) -> bool {
        conn.broken
    }

    async fn cleanup(&self, conn: FakeConn) {
        drop(conn);
        self.state.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Small pool with no warm-up and a short acquire timeout.
pub fn config(max_total: usize) -> PoolConfig {
    PoolConfig::default()
        .with_max_total(max_total)
        .with_idle(0, max_total)
        .with_acquire_timeout(Some(Duration::from_millis(50)))
}

/// Let spawned cleanup tasks run.
pub async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}
