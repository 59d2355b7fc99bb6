//! Resource pool: generic pool driven by the `Resource` trait.
//!
//! `Pool<R>` calls `R::create`, `R::validate`, `R::has_broken` and
//! `R::cleanup` directly. All bookkeeping (idle queue, live size, lease and
//! waiter counts) sits behind one mutex; blocked acquirers wait on a
//! [`Notify`] that fires whenever an instance comes back or a slot frees up.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::resource::{Entry, Resource, ResourceId, ResourceState};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Pool statistics.
///
/// `active`, `idle`, `waiting` and `size` are a snapshot of the current
/// state; the rest are monotonic counters since the pool was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Instances currently leased.
    pub active: usize,
    /// Instances sitting in the idle queue.
    pub idle: usize,
    /// Callers blocked in `acquire`.
    pub waiting: usize,
    /// Live instances plus reserved creation slots. Never exceeds `max_total`.
    pub size: usize,
    /// Instances ever created.
    pub created: u64,
    /// Instances ever destroyed.
    pub destroyed: u64,
    /// Successful acquisitions.
    pub acquired: u64,
    /// Leases returned.
    pub released: u64,
    /// Failed liveness checks.
    pub validation_failures: u64,
    /// Acquisitions that ended in `PoolExhausted`.
    pub exhausted: u64,
    /// Failed `create` calls.
    pub creation_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    destroyed: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    validation_failures: AtomicU64,
    exhausted: AtomicU64,
    creation_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub(crate) struct State<T> {
    pub(crate) idle: VecDeque<Entry<T>>,
    /// Idle + leased + validating instances, plus creation slots in flight.
    pub(crate) size: usize,
    pub(crate) leased: usize,
    pub(crate) waiting: usize,
    pub(crate) closed: bool,
}

/// Inner shared state for the pool.
pub(crate) struct Shared<R: Resource> {
    pub(crate) resource: R,
    pub(crate) config: PoolConfig,
    pub(crate) state: Mutex<State<R::Instance>>,
    /// Fired when an instance returns or a slot frees up.
    pub(crate) released: Notify,
    /// Cancelled once at shutdown; stops background maintenance.
    pub(crate) shutdown: CancellationToken,
    counters: Counters,
    next_id: AtomicU64,
}

impl<R: Resource> Shared<R> {
    fn next_id(&self) -> ResourceId {
        ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Return a leased entry. Runs synchronously from `Lease::drop`.
    pub(crate) fn release(this: &Arc<Self>, mut entry: Entry<R::Instance>) {
        let broken = entry.info.state == ResourceState::Invalid
            || this.resource.has_broken(&mut entry.instance);

        let discard = {
            let mut state = this.state.lock();
            state.leased = state.leased.saturating_sub(1);
            if broken || state.closed || state.idle.len() >= this.config.max_idle {
                state.size = state.size.saturating_sub(1);
                entry.transition(ResourceState::Invalid);
                Some(entry)
            } else {
                entry.transition(ResourceState::Idle);
                state.idle.push_back(entry);
                None
            }
        };

        bump(&this.counters.released);
        this.released.notify_waiters();

        if let Some(entry) = discard {
            Self::discard(this, entry, broken);
        }
    }

    /// Destroy an entry from a synchronous context.
    fn discard(this: &Arc<Self>, entry: Entry<R::Instance>, broken: bool) {
        bump(&this.counters.destroyed);
        debug!(
            pool = this.resource.id(),
            resource_id = %entry.id(),
            broken,
            "destroying released resource"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(this);
                drop(handle.spawn(async move {
                    shared.resource.cleanup(entry.instance).await;
                }));
            }
            Err(_) => drop(entry),
        }
    }

    /// Destroy an entry whose slot has already been removed from `size`.
    pub(crate) async fn destroy(&self, entry: Entry<R::Instance>) {
        bump(&self.counters.destroyed);
        debug!(pool = self.resource.id(), resource_id = %entry.id(), "destroying resource");
        self.resource.cleanup(entry.instance).await;
    }

    /// Free one slot and wake waiters so they can create in its place.
    fn free_slot(&self) {
        {
            let mut state = self.state.lock();
            state.size = state.size.saturating_sub(1);
        }
        self.released.notify_waiters();
    }

    /// Put an entry back after an interrupted validation without touching its
    /// usage timestamps.
    pub(crate) async fn return_idle(&self, mut entry: Entry<R::Instance>) {
        let rejected = {
            let mut state = self.state.lock();
            if state.closed || state.idle.len() >= self.config.max_idle {
                state.size = state.size.saturating_sub(1);
                Some(entry)
            } else {
                entry.info.state = ResourceState::Idle;
                state.idle.push_back(entry);
                None
            }
        };
        self.released.notify_waiters();
        if let Some(entry) = rejected {
            self.destroy(entry).await;
        }
    }

    /// Validate an entry taken out of the idle queue.
    ///
    /// Only the caller's context bounds the check. An interrupted check
    /// says nothing about the instance, so the entry comes back intact.
    pub(crate) async fn validate_entry(
        &self,
        mut entry: Entry<R::Instance>,
        ctx: &Context,
    ) -> Validation<R::Instance> {
        entry.info.state = ResourceState::Validating;

        let source: crate::error::BoxError =
            match ctx.run(self.resource.validate(&mut entry.instance, ctx)).await {
                Err(_) => return Validation::Interrupted(entry),
                Ok(Ok(())) => {
                    entry.mark_validated();
                    return Validation::Passed(entry);
                }
                Ok(Err(e)) => e.into(),
            };

        bump(&self.counters.validation_failures);
        warn!(
            pool = self.resource.id(),
            resource_id = %entry.id(),
            error = %source,
            "resource failed validation, discarding"
        );
        let err = Error::ValidationFailed {
            pool: self.resource.id().to_string(),
            id: entry.id(),
            source,
        };

        entry.info.state = ResourceState::Invalid;
        {
            let mut state = self.state.lock();
            state.size = state.size.saturating_sub(1);
        }
        self.destroy(entry).await;
        self.released.notify_waiters();
        Validation::Failed(err)
    }

    pub(crate) fn record_created(&self, id: ResourceId) {
        bump(&self.counters.created);
        debug!(pool = self.resource.id(), resource_id = %id, "created resource");
    }

    pub(crate) fn record_creation_failure(&self, error: &dyn std::fmt::Display) {
        bump(&self.counters.creation_failures);
        warn!(pool = self.resource.id(), error = %error, "resource creation failed");
    }

    pub(crate) fn new_entry(&self, instance: R::Instance) -> Entry<R::Instance> {
        let entry = Entry::new(self.next_id(), instance);
        self.record_created(entry.id());
        entry
    }

    fn closed_error(&self) -> Error {
        Error::PoolClosed {
            pool: self.resource.id().to_string(),
        }
    }

    fn cancelled_error(&self) -> Error {
        Error::Cancelled {
            pool: self.resource.id().to_string(),
        }
    }
}

/// Result of validating an idle entry.
pub(crate) enum Validation<T> {
    Passed(Entry<T>),
    /// The entry was destroyed and its slot freed.
    Failed(Error),
    /// The caller's context ended mid-check; the entry is intact.
    Interrupted(Entry<T>),
}

/// Holds a reserved `size` slot; frees it on drop unless committed.
pub(crate) struct SlotReservation<'a, R: Resource> {
    shared: &'a Shared<R>,
    armed: bool,
}

impl<'a, R: Resource> SlotReservation<'a, R> {
    /// Wrap a slot already counted in `size`.
    pub(crate) fn new(shared: &'a Shared<R>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    pub(crate) fn commit(mut self) {
        self.armed = false;
    }
}

impl<R: Resource> Drop for SlotReservation<'_, R> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.free_slot();
        }
    }
}

/// Counts a caller in `waiting` for as long as it is alive.
struct WaitGuard<'a, R: Resource> {
    shared: &'a Shared<R>,
}

impl<'a, R: Resource> WaitGuard<'a, R> {
    fn new(shared: &'a Shared<R>) -> Self {
        shared.state.lock().waiting += 1;
        Self { shared }
    }
}

impl<R: Resource> Drop for WaitGuard<'_, R> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.waiting = state.waiting.saturating_sub(1);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

enum Step<T> {
    Idle(Entry<T>),
    Create,
    Wait { size: usize },
}

// ---------------------------------------------------------------------------
// Pool<R>
// ---------------------------------------------------------------------------

/// Generic resource pool.
///
/// Manages a bounded set of `R::Instance` objects, creating, validating and
/// destroying them via the [`Resource`] trait. Cloning is cheap and yields a
/// handle to the same pool.
pub struct Pool<R: Resource> {
    pub(crate) inner: Arc<Shared<R>>,
}

impl<R: Resource> Clone for Pool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Resource> std::fmt::Debug for Pool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("resource_id", &self.inner.resource.id())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<R: Resource> Pool<R> {
    /// Create a new pool for the given resource and pool settings.
    ///
    /// No instances are created up front; run a maintenance cycle (or
    /// [`spawn_maintenance`](Self::spawn_maintenance)) to warm `min_idle`.
    ///
    /// # Errors
    /// Returns error if `config` is invalid (e.g. `max_total == 0`).
    pub fn new(resource: R, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config.max_idle;
        Ok(Self {
            inner: Arc::new(Shared {
                resource,
                config,
                state: Mutex::new(State {
                    idle: VecDeque::with_capacity(capacity),
                    size: 0,
                    leased: 0,
                    waiting: 0,
                    closed: false,
                }),
                released: Notify::new(),
                shutdown: CancellationToken::new(),
                counters: Counters::default(),
                next_id: AtomicU64::new(0),
            }),
        })
    }

    /// Acquire an instance from the pool.
    ///
    /// Reuses an idle instance when one is available, validating it first if
    /// `validate_on_acquire` is set; an instance that fails validation is
    /// destroyed and the search continues. Otherwise a new instance is
    /// created if the pool is below `max_total`. Otherwise the call waits for
    /// a release until `acquire_timeout` (or the context deadline) elapses.
    /// `acquire_timeout` only bounds that wait; `create` and `validate` run
    /// under `ctx` alone, so a zero timeout still creates below `max_total`.
    ///
    /// # Errors
    /// - [`Error::PoolExhausted`] if nothing became available in time.
    /// - [`Error::ResourceCreationFailed`] if a new instance was attempted
    ///   and `create` failed. Creation is not retried here.
    /// - [`Error::Cancelled`] if the context's token fires, or its deadline
    ///   passes during a creation or a validation.
    /// - [`Error::PoolClosed`] after [`shutdown`](Self::shutdown).
    pub async fn acquire(&self, ctx: &Context) -> Result<Lease<R>> {
        let shared = &*self.inner;
        let started = Instant::now();
        let deadline = shared.config.acquire_deadline(started, ctx);
        let mut waiter: Option<WaitGuard<'_, R>> = None;

        loop {
            if ctx.cancellation().is_cancelled() {
                return Err(shared.cancelled_error());
            }

            // Register for release signals before inspecting state so a
            // release between the check and the wait is not missed.
            let released = shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let step = {
                let mut state = shared.state.lock();
                if state.closed {
                    return Err(shared.closed_error());
                }
                let idle = if shared.config.lifo {
                    state.idle.pop_back()
                } else {
                    state.idle.pop_front()
                };
                match idle {
                    Some(entry) => {
                        if !shared.config.validate_on_acquire {
                            state.leased += 1;
                        }
                        Step::Idle(entry)
                    }
                    None if state.size < shared.config.max_total => {
                        state.size += 1;
                        Step::Create
                    }
                    None => Step::Wait { size: state.size },
                }
            };

            match step {
                Step::Idle(entry) if !shared.config.validate_on_acquire => {
                    return Ok(self.lease(entry));
                }
                Step::Idle(entry) => match shared.validate_entry(entry, ctx).await {
                    Validation::Passed(entry) => {
                        let closed = {
                            let mut state = shared.state.lock();
                            if state.closed {
                                state.size = state.size.saturating_sub(1);
                            } else {
                                state.leased += 1;
                            }
                            state.closed
                        };
                        if closed {
                            shared.destroy(entry).await;
                            shared.released.notify_waiters();
                            return Err(shared.closed_error());
                        }
                        return Ok(self.lease(entry));
                    }
                    Validation::Failed(_) => {}
                    Validation::Interrupted(entry) => {
                        shared.return_idle(entry).await;
                        return Err(shared.cancelled_error());
                    }
                },
                Step::Create => return self.create(ctx).await,
                Step::Wait { size } => {
                    let now = Instant::now();
                    if deadline.is_some_and(|d| d <= now) {
                        bump(&shared.counters.exhausted);
                        debug!(
                            pool = shared.resource.id(),
                            size,
                            max_total = shared.config.max_total,
                            "pool exhausted"
                        );
                        return Err(Error::PoolExhausted {
                            pool: shared.resource.id().to_string(),
                            size,
                            max_total: shared.config.max_total,
                            waited: now.saturating_duration_since(started),
                        });
                    }
                    if waiter.is_none() {
                        waiter = Some(WaitGuard::new(shared));
                    }
                    tokio::select! {
                        () = released => {}
                        () = sleep_until(deadline) => {}
                        () = ctx.cancellation().cancelled() => {
                            return Err(shared.cancelled_error());
                        }
                    }
                }
            }
        }
    }

    /// Create an instance in a slot already reserved in `size`.
    ///
    /// `acquire_timeout` bounds waiting for a free slot, not the connect
    /// itself; only the caller's context can cut a creation short.
    async fn create(&self, ctx: &Context) -> Result<Lease<R>> {
        let shared = &*self.inner;
        let slot = SlotReservation::new(shared);

        let instance = match ctx.run(shared.resource.create(ctx)).await {
            Err(_) => return Err(shared.cancelled_error()),
            Ok(Ok(instance)) => instance,
            Ok(Err(e)) => {
                shared.record_creation_failure(&e);
                return Err(Error::creation(shared.resource.id(), e));
            }
        };

        let entry = shared.new_entry(instance);
        let closed = {
            let mut state = shared.state.lock();
            if !state.closed {
                state.leased += 1;
            }
            state.closed
        };
        if closed {
            drop(slot);
            shared.destroy(entry).await;
            return Err(shared.closed_error());
        }

        slot.commit();
        Ok(self.lease(entry))
    }

    fn lease(&self, entry: Entry<R::Instance>) -> Lease<R> {
        bump(&self.inner.counters.acquired);
        Lease::new(entry, Arc::clone(&self.inner))
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let (active, idle, waiting, size) = {
            let state = self.inner.state.lock();
            (state.leased, state.idle.len(), state.waiting, state.size)
        };
        let c = &self.inner.counters;
        PoolStats {
            active,
            idle,
            waiting,
            size,
            created: c.created.load(Ordering::Relaxed),
            destroyed: c.destroyed.load(Ordering::Relaxed),
            acquired: c.acquired.load(Ordering::Relaxed),
            released: c.released.load(Ordering::Relaxed),
            validation_failures: c.validation_failures.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
            creation_failures: c.creation_failures.load(Ordering::Relaxed),
        }
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The pooled resource.
    pub fn resource(&self) -> &R {
        &self.inner.resource
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Shut down the pool.
    ///
    /// Closes the pool to new acquisitions, fails every blocked acquirer with
    /// [`Error::PoolClosed`], destroys idle instances and waits for leased
    /// ones to be released (they are destroyed on return).
    ///
    /// # Errors
    /// [`Error::ShutdownTimeout`] if `ctx` is cancelled or its deadline passes
    /// while leases are still outstanding. The pool stays closed either way.
    pub async fn shutdown(&self, ctx: &Context) -> Result<()> {
        let shared = &*self.inner;
        let drained: Vec<_> = {
            let mut state = shared.state.lock();
            if !state.closed {
                state.closed = true;
                info!(
                    pool = shared.resource.id(),
                    idle = state.idle.len(),
                    leased = state.leased,
                    "shutting down pool"
                );
            }
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.size = state.size.saturating_sub(drained.len());
            drained
        };
        shared.shutdown.cancel();
        shared.released.notify_waiters();

        for entry in drained {
            shared.destroy(entry).await;
        }

        loop {
            let released = shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if shared.state.lock().size == 0 {
                info!(pool = shared.resource.id(), "pool drained");
                return Ok(());
            }

            tokio::select! {
                () = released => {}
                _ = ctx.done() => {
                    let outstanding = shared.state.lock().size;
                    warn!(
                        pool = shared.resource.id(),
                        outstanding,
                        "pool shutdown interrupted with leases outstanding"
                    );
                    return Err(Error::ShutdownTimeout {
                        pool: shared.resource.id().to_string(),
                        outstanding,
                    });
                }
            }
        }
    }
}
