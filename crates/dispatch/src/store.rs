//! Dedup store over a pooled key-value connection
//!
//! Every operation leases exactly one connection for its duration. A
//! connection whose call failed at the connection level, or was cut short,
//! is invalidated instead of going back to the pool.

use std::time::Duration;

use chrono::Utc;
use herald_pool::{Context, Interrupted, Lease, Pool, PoolConfig, PoolStats, Resource};
use tracing::debug;

use crate::config::{DEFAULT_KEY_PREFIX, StoreConfig};
use crate::driver::{DriverError, StoreConnection, StoreDriver};
use crate::error::{StoreError, StoreOperation};
use crate::message::DedupRecord;

/// Pooled resource adapter: connect, ping on borrow, drop when broken.
pub struct StoreResource<D> {
    driver: D,
}

impl<D: StoreDriver> StoreResource<D> {
    pub fn driver(&self) -> &D {
        &self.driver
    }
}

impl<D: StoreDriver> Resource for StoreResource<D> {
    type Instance = D::Connection;
    type Error = DriverError;

    fn id(&self) -> &str {
        self.driver.name()
    }

    async fn create(&self, ctx: &Context) -> Result<D::Connection, DriverError> {
        self.driver.connect(ctx).await
    }

    async fn validate(&self, conn: &mut D::Connection, ctx: &Context) -> Result<(), DriverError> {
        conn.ping(ctx).await
    }

    fn has_broken(&self, conn: &mut D::Connection) -> bool {
        conn.is_broken()
    }
}

/// Records which identifiers have been dispatched.
///
/// Keys are `<key_prefix><identifier>`; the value is the record time in
/// epoch milliseconds. There are no retries: pool errors pass through as
/// [`StoreError::Pool`], driver errors become [`StoreError::Unavailable`].
pub struct DedupStore<D: StoreDriver> {
    pool: Pool<StoreResource<D>>,
    key_prefix: String,
    operation_timeout: Option<Duration>,
}

impl<D: StoreDriver> Clone for DedupStore<D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            key_prefix: self.key_prefix.clone(),
            operation_timeout: self.operation_timeout,
        }
    }
}

impl<D: StoreDriver> std::fmt::Debug for DedupStore<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupStore")
            .field("pool", &self.pool)
            .field("key_prefix", &self.key_prefix)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl<D: StoreDriver> DedupStore<D> {
    /// Build a store with the default key prefix and no per-call timeout.
    pub fn new(driver: D, pool: PoolConfig) -> Result<Self, herald_pool::Error> {
        Ok(Self {
            pool: Pool::new(StoreResource { driver }, pool)?,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            operation_timeout: None,
        })
    }

    /// Build a store from the pool and store sections of the configuration.
    pub fn with_config(
        driver: D,
        pool: PoolConfig,
        store: &StoreConfig,
    ) -> Result<Self, herald_pool::Error> {
        Ok(Self::new(driver, pool)?
            .with_key_prefix(store.key_prefix.clone())
            .with_operation_timeout(store.operation_timeout))
    }

    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Bound each driver call. The caller's context still applies.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// The store key for an identifier.
    pub fn key_for(&self, identifier: &str) -> String {
        format!("{}{identifier}", self.key_prefix)
    }

    /// Whether `identifier` has been recorded and not yet expired.
    pub async fn exists(&self, ctx: &Context, identifier: &str) -> Result<bool, StoreError> {
        let op = StoreOperation::Exists;
        let key = self.key_for(identifier);
        let mut lease = self.lease(ctx).await?;
        let call = self.call_context(ctx);
        let result = call.run(lease.get(&call, &key)).await;
        settle(lease, op, result).map(|value| value.is_some())
    }

    /// Record `identifier` for `ttl`. Overwrites an existing record.
    pub async fn record(
        &self,
        ctx: &Context,
        identifier: &str,
        ttl: Duration,
    ) -> Result<DedupRecord, StoreError> {
        let op = StoreOperation::Record;
        let record = DedupRecord {
            identifier: identifier.to_string(),
            recorded_at: Utc::now(),
            ttl,
        };
        let key = self.key_for(identifier);
        let value = record.stored_value();

        let mut lease = self.lease(ctx).await?;
        let call = self.call_context(ctx);
        let result = call.run(lease.set(&call, &key, &value, ttl)).await;
        settle(lease, op, result)?;
        debug!(identifier, ttl_secs = ttl.as_secs(), "recorded identifier");
        Ok(record)
    }

    /// Delete the record for `identifier`. Returns whether it existed.
    pub async fn remove(&self, ctx: &Context, identifier: &str) -> Result<bool, StoreError> {
        let op = StoreOperation::Remove;
        let key = self.key_for(identifier);
        let mut lease = self.lease(ctx).await?;
        let call = self.call_context(ctx);
        let result = call.run(lease.del(&call, &key)).await;
        settle(lease, op, result)
    }

    /// Close the connection pool.
    pub async fn shutdown(&self, ctx: &Context) -> Result<(), StoreError> {
        self.pool.shutdown(ctx).await.map_err(StoreError::Pool)
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn pool(&self) -> &Pool<StoreResource<D>> {
        &self.pool
    }

    async fn lease(&self, ctx: &Context) -> Result<Lease<StoreResource<D>>, StoreError> {
        Ok(self.pool.acquire(ctx).await?)
    }

    fn call_context(&self, ctx: &Context) -> Context {
        match self.operation_timeout {
            Some(timeout) => ctx.child().with_timeout(timeout),
            None => ctx.child(),
        }
    }
}

/// Map a driver call result and decide the lease's fate.
fn settle<R, T>(
    lease: Lease<R>,
    operation: StoreOperation,
    result: Result<Result<T, DriverError>, Interrupted>,
) -> Result<T, StoreError>
where
    R: Resource,
{
    match result {
        Ok(Ok(value)) => {
            lease.release();
            Ok(value)
        }
        Ok(Err(source)) => {
            if source.is_connection() {
                lease.invalidate();
            } else {
                lease.release();
            }
            Err(StoreError::Unavailable { operation, source })
        }
        Err(reason) => {
            // the reply may still be in flight on this connection
            lease.invalidate();
            Err(StoreError::Interrupted { operation, reason })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fault, MemoryStore, StoreOp};
    use pretty_assertions::assert_eq;

    fn store(memory: &MemoryStore) -> DedupStore<MemoryStore> {
        let pool = PoolConfig::default().with_idle(0, 4).with_max_total(4);
        DedupStore::new(memory.clone(), pool).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn record_then_exists() {
        let memory = MemoryStore::new();
        let store = store(&memory);
        let ctx = Context::new();

        assert!(!store.exists(&ctx, "a").await.unwrap());
        let record = store.record(&ctx, "a", Duration::from_secs(60)).await.unwrap();
        assert!(store.exists(&ctx, "a").await.unwrap());

        assert_eq!(record.identifier, "a");
        assert_eq!(
            memory.value("message:uuid:a"),
            Some(record.recorded_at.timestamp_millis().to_string())
        );
        assert_eq!(memory.ttl("message:uuid:a"), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn record_twice_is_idempotent() {
        let memory = MemoryStore::new();
        let store = store(&memory);
        let ctx = Context::new();
        let ttl = Duration::from_secs(60);

        store.record(&ctx, "a", ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        store.record(&ctx, "a", ttl).await.unwrap();

        assert!(store.exists(&ctx, "a").await.unwrap());
        assert_eq!(memory.len(), 1);
        assert_eq!(memory.ttl("message:uuid:a"), Some(ttl));
    }

    #[tokio::test]
    async fn every_operation_returns_its_lease() {
        let memory = MemoryStore::new();
        let store = store(&memory);
        let ctx = Context::new();

        store.exists(&ctx, "a").await.unwrap();
        store.record(&ctx, "a", Duration::from_secs(1)).await.unwrap();
        store.remove(&ctx, "a").await.unwrap();

        let stats = store.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.acquired, 3);
        assert_eq!(stats.released, 3);
        assert_eq!(stats.created, 1);
    }

    #[tokio::test]
    async fn connection_error_invalidates_lease() {
        let memory = MemoryStore::new();
        let store = store(&memory);
        memory.set_fault(StoreOp::Get, Fault::Fail);

        let err = store.exists(&Context::new(), "a").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Unavailable { operation: StoreOperation::Exists, .. }
        ));
        let stats = store.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.destroyed, 1);
    }

    #[tokio::test]
    async fn rejection_keeps_connection() {
        let memory = MemoryStore::new();
        let store = store(&memory);
        memory.set_fault(StoreOp::Set, Fault::Reject);

        let err = store
            .record(&Context::new(), "a", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
        assert_eq!(store.stats().idle, 1);
        assert_eq!(store.stats().destroyed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn operation_timeout_interrupts_and_invalidates() {
        let memory = MemoryStore::new();
        let store = store(&memory).with_operation_timeout(Some(Duration::from_millis(100)));
        memory.set_fault(StoreOp::Get, Fault::Stall(Duration::from_secs(10)));

        let err = store.exists(&Context::new(), "a").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Interrupted {
                operation: StoreOperation::Exists,
                reason: Interrupted::DeadlineExceeded,
            }
        ));
        assert_eq!(store.stats().size, 0);
    }

    #[tokio::test]
    async fn remove_reports_existence() {
        let memory = MemoryStore::new();
        let store = store(&memory).with_key_prefix("sent:");
        let ctx = Context::new();

        store.record(&ctx, "a", Duration::from_secs(60)).await.unwrap();
        assert!(memory.contains("sent:a"));
        assert!(store.remove(&ctx, "a").await.unwrap());
        assert!(!store.remove(&ctx, "a").await.unwrap());
    }
}
