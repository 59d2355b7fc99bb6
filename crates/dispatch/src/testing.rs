//! In-memory drivers with programmable faults
//!
//! [`MemoryStore`] and [`RecordingBroker`] stand in for the real store and
//! broker. Each operation can be programmed to fail or stall, calls are
//! counted, and store records honour their TTL on the tokio clock (so
//! `start_paused` tests can expire them with `tokio::time::advance`).

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use herald_pool::Context;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::driver::{BrokerDriver, DriverError, StoreConnection, StoreDriver};
use crate::message::Delivery;

/// Programmed behavior for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a connection-class error
    Fail,
    /// Fail with an error reply; the connection stays usable
    Reject,
    /// Sleep before carrying on normally
    Stall(Duration),
}

/// Per-operation faults and call counters.
#[derive(Debug)]
struct Faults<Op> {
    programmed: Mutex<HashMap<Op, Fault>>,
    calls: Mutex<HashMap<Op, usize>>,
}

impl<Op> Default for Faults<Op> {
    fn default() -> Self {
        Self {
            programmed: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<Op: Copy + Eq + Hash + fmt::Display> Faults<Op> {
    fn set(&self, op: Op, fault: Fault) {
        self.programmed.lock().insert(op, fault);
    }

    fn clear(&self, op: Op) {
        self.programmed.lock().remove(&op);
    }

    fn clear_all(&self) {
        self.programmed.lock().clear();
    }

    fn calls(&self, op: Op) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Count the call and apply its fault, if any.
    async fn enter(&self, op: Op) -> Result<(), DriverError> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        let fault = self.programmed.lock().get(&op).copied();
        match fault {
            None => Ok(()),
            Some(Fault::Fail) => Err(DriverError::connection(format!("injected {op} failure"))),
            Some(Fault::Reject) => Err(DriverError::rejected(format!("injected {op} rejection"))),
            Some(Fault::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Store operations that can be programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Connect,
    Ping,
    Get,
    Set,
    Del,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Ping => "ping",
            Self::Get => "get",
            Self::Set => "set",
            Self::Del => "del",
        })
    }
}

#[derive(Debug, Clone)]
struct Stored {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct StoreInner {
    data: DashMap<String, Stored>,
    faults: Faults<StoreOp>,
    next_connection: AtomicU64,
}

impl StoreInner {
    fn live(&self, key: &str) -> Option<Stored> {
        let now = Instant::now();
        let stored = self.data.get(key).map(|entry| entry.value().clone())?;
        if stored.expires_at <= now {
            self.data.remove_if(key, |_, s| s.expires_at <= now);
            return None;
        }
        Some(stored)
    }
}

/// In-memory key-value store driver.
///
/// Clones share the same data, faults and counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fault(&self, op: StoreOp, fault: Fault) {
        self.inner.faults.set(op, fault);
    }

    pub fn clear_fault(&self, op: StoreOp) {
        self.inner.faults.clear(op);
    }

    pub fn clear_faults(&self) {
        self.inner.faults.clear_all();
    }

    /// Calls made to `op`, including failed ones.
    pub fn calls(&self, op: StoreOp) -> usize {
        self.inner.faults.calls(op)
    }

    /// Connections opened successfully.
    pub fn connections(&self) -> u64 {
        self.inner.next_connection.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.live(key).is_some()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.inner.live(key).map(|s| s.value)
    }

    /// Time left before `key` expires.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.inner
            .live(key)
            .map(|s| s.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Seed a key directly, bypassing faults and counters.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        self.inner.data.insert(
            key.into(),
            Stored {
                value: value.into(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .data
            .iter()
            .filter(|entry| entry.value().expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StoreDriver for MemoryStore {
    type Connection = MemoryConnection;

    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, _ctx: &Context) -> Result<MemoryConnection, DriverError> {
        self.inner.faults.enter(StoreOp::Connect).await?;
        let id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            id,
            inner: Arc::clone(&self.inner),
            broken: false,
        })
    }
}

/// Connection handed out by [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    inner: Arc<StoreInner>,
    broken: bool,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    async fn enter(&mut self, op: StoreOp) -> Result<(), DriverError> {
        let result = self.inner.faults.enter(op).await;
        if result.as_ref().is_err_and(DriverError::is_connection) {
            self.broken = true;
        }
        result
    }
}

impl StoreConnection for MemoryConnection {
    async fn ping(&mut self, _ctx: &Context) -> Result<(), DriverError> {
        self.enter(StoreOp::Ping).await
    }

    async fn get(&mut self, _ctx: &Context, key: &str) -> Result<Option<String>, DriverError> {
        self.enter(StoreOp::Get).await?;
        Ok(self.inner.live(key).map(|s| s.value))
    }

    async fn set(
        &mut self,
        _ctx: &Context,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), DriverError> {
        self.enter(StoreOp::Set).await?;
        self.inner.data.insert(
            key.to_string(),
            Stored {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn del(&mut self, _ctx: &Context, key: &str) -> Result<bool, DriverError> {
        self.enter(StoreOp::Del).await?;
        let existed = self.inner.live(key).is_some();
        self.inner.data.remove(key);
        Ok(existed)
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Broker operations that can be programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOp {
    Publish,
    Close,
}

impl fmt::Display for BrokerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Publish => "publish",
            Self::Close => "close",
        })
    }
}

/// A message the broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub key: String,
    pub payload: Bytes,
    pub delivery: Delivery,
}

#[derive(Debug, Default)]
struct BrokerInner {
    published: Mutex<Vec<Published>>,
    faults: Faults<BrokerOp>,
    next_offset: AtomicI64,
    closed: AtomicBool,
}

/// Broker driver that keeps every accepted message in memory.
///
/// Clones share the same log, faults and counters.
#[derive(Debug, Clone, Default)]
pub struct RecordingBroker {
    inner: Arc<BrokerInner>,
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fault(&self, op: BrokerOp, fault: Fault) {
        self.inner.faults.set(op, fault);
    }

    pub fn clear_fault(&self, op: BrokerOp) {
        self.inner.faults.clear(op);
    }

    /// Calls made to `op`, including failed ones.
    pub fn calls(&self, op: BrokerOp) -> usize {
        self.inner.faults.calls(op)
    }

    /// Accepted messages in publish order.
    pub fn published(&self) -> Vec<Published> {
        self.inner.published.lock().clone()
    }

    pub fn published_keys(&self) -> Vec<String> {
        self.inner
            .published
            .lock()
            .iter()
            .map(|p| p.key.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl BrokerDriver for RecordingBroker {
    fn name(&self) -> &str {
        "recording"
    }

    async fn publish(
        &self,
        _ctx: &Context,
        key: &str,
        payload: Bytes,
    ) -> Result<Delivery, DriverError> {
        self.inner.faults.enter(BrokerOp::Publish).await?;
        if self.is_closed() {
            return Err(DriverError::connection("producer is closed"));
        }
        let delivery = Delivery {
            partition: Some(0),
            offset: Some(self.inner.next_offset.fetch_add(1, Ordering::SeqCst)),
        };
        self.inner.published.lock().push(Published {
            key: key.to_string(),
            payload,
            delivery,
        });
        Ok(delivery)
    }

    async fn close(&self, _ctx: &Context) -> Result<(), DriverError> {
        self.inner.faults.enter(BrokerOp::Close).await?;
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
