//! Shared fixtures for dispatcher integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use herald_dispatch::testing::{MemoryStore, RecordingBroker};
use herald_dispatch::{DedupStore, Dispatcher, Message};
use herald_pool::PoolConfig;

static TRACING: Once = Once::new();

/// Route logs through the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub type TestDispatcher = Dispatcher<MemoryStore, RecordingBroker>;

/// Dispatcher wired to in-memory drivers the test keeps handles to.
pub struct Harness {
    pub store: MemoryStore,
    pub broker: RecordingBroker,
    pub dispatcher: Arc<TestDispatcher>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_pool(pool_config(4))
    }

    pub fn with_pool(pool: PoolConfig) -> Self {
        Self::build(pool, |d| d)
    }

    /// Customize the dispatcher before it is shared.
    pub fn build(pool: PoolConfig, customize: impl FnOnce(TestDispatcher) -> TestDispatcher) -> Self {
        init_tracing();
        let store = MemoryStore::new();
        let broker = RecordingBroker::new();
        let dedup = DedupStore::new(store.clone(), pool).unwrap();
        let dispatcher = customize(Dispatcher::new(dedup, broker.clone()));
        Self {
            store,
            broker,
            dispatcher: Arc::new(dispatcher),
        }
    }

    /// Store key for an identifier.
    pub fn key(&self, identifier: &str) -> String {
        self.dispatcher.store().key_for(identifier)
    }
}

/// Small pool, no warm-up, short acquire timeout.
pub fn pool_config(max_total: usize) -> PoolConfig {
    PoolConfig::default()
        .with_max_total(max_total)
        .with_idle(0, max_total)
        .with_acquire_timeout(Some(Duration::from_millis(50)))
}

pub fn message(identifier: &str, payload: &'static str) -> Message {
    Message::with_identifier(identifier, payload).unwrap()
}
