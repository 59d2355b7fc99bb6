//! Core resource trait and per-instance metadata
//!
//! The `Resource` trait defines how to create, validate and clean up pooled
//! instances. The pool calls these hooks directly; there are no closure
//! factories.

use std::fmt;
use std::future::Future;

use tokio::time::Instant;

use crate::context::Context;

/// Lifecycle hooks for a pooled resource type (bb8-style).
///
/// `Pool<R>` owns an `R` and calls these hooks to grow, validate and shrink the
/// set of live instances.
pub trait Resource: Send + Sync + 'static {
    /// The instance type produced by this resource (e.g. a connection).
    type Instance: Send + 'static;

    /// The error produced by `create` and `validate`.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Name used in errors and logs (e.g. "redis").
    fn id(&self) -> &str;

    /// Create a new instance. Called when the pool needs to grow.
    fn create(
        &self,
        ctx: &Context,
    ) -> impl Future<Output = Result<Self::Instance, Self::Error>> + Send;

    /// Liveness check run before handing out an idle instance (when
    /// `validate_on_acquire` is set) and during idle maintenance.
    fn validate(
        &self,
        _instance: &mut Self::Instance,
        _ctx: &Context,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Cheap synchronous check run on release. A broken instance is
    /// destroyed instead of returning to the idle queue.
    fn has_broken(&self, _instance: &mut Self::Instance) -> bool {
        false
    }

    /// Clean up an instance when it is permanently removed.
    fn cleanup(&self, instance: Self::Instance) -> impl Future<Output = ()> + Send {
        drop(instance);
        async {}
    }
}

/// Opaque handle of a pooled instance, unique within one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u64);

impl ResourceId {
    /// The raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a pooled instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Sitting in the idle queue
    Idle,
    /// Held by a lease
    Borrowed,
    /// Taken out of the idle queue for a liveness check
    Validating,
    /// Marked for destruction; never handed out again
    Invalid,
}

/// Snapshot of a pooled instance's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceInfo {
    /// Handle of the instance
    pub id: ResourceId,
    /// Current lifecycle state
    pub state: ResourceState,
    /// When the instance was created
    pub created_at: Instant,
    /// When the instance was last handed out or returned
    pub last_used_at: Instant,
    /// When the instance last passed validation
    pub last_validated_at: Option<Instant>,
}

/// A pool entry wrapping a resource instance.
pub(crate) struct Entry<T> {
    pub(crate) instance: T,
    pub(crate) info: ResourceInfo,
}

impl<T> Entry<T> {
    pub(crate) fn new(id: ResourceId, instance: T) -> Self {
        let now = Instant::now();
        Self {
            instance,
            info: ResourceInfo {
                id,
                state: ResourceState::Borrowed,
                created_at: now,
                last_used_at: now,
                last_validated_at: None,
            },
        }
    }

    pub(crate) fn id(&self) -> ResourceId {
        self.info.id
    }

    pub(crate) fn transition(&mut self, state: ResourceState) {
        self.info.state = state;
        if matches!(state, ResourceState::Idle | ResourceState::Borrowed) {
            self.info.last_used_at = Instant::now();
        }
    }

    pub(crate) fn mark_validated(&mut self) {
        self.info.last_validated_at = Some(Instant::now());
    }

    pub(crate) fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.info.last_used_at)
    }
}
