//! RAII lease over a pooled instance

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::pool::Shared;
use crate::resource::{Entry, Resource, ResourceId, ResourceInfo, ResourceState};

/// Exclusive, time-bounded use of one pooled instance.
///
/// Dropping the lease returns the instance to the pool. The pool still owns
/// the instance's lifecycle: a lease can give it back ([`release`]) or flag it
/// as unusable ([`invalidate`]) but cannot take it out of the pool.
///
/// [`release`]: Lease::release
/// [`invalidate`]: Lease::invalidate
pub struct Lease<R: Resource> {
    entry: Option<Entry<R::Instance>>,
    shared: Arc<Shared<R>>,
}

impl<R: Resource> Lease<R> {
    pub(crate) fn new(mut entry: Entry<R::Instance>, shared: Arc<Shared<R>>) -> Self {
        entry.transition(ResourceState::Borrowed);
        Self {
            entry: Some(entry),
            shared,
        }
    }

    /// Handle of the leased instance.
    pub fn id(&self) -> ResourceId {
        self.entry().id()
    }

    /// Metadata snapshot of the leased instance.
    pub fn info(&self) -> ResourceInfo {
        self.entry().info
    }

    /// Return the instance to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Return the instance for destruction instead of reuse.
    ///
    /// Use when the instance is in an unknown state, e.g. an operation on it
    /// was abandoned halfway.
    pub fn invalidate(mut self) {
        if let Some(entry) = self.entry.as_mut() {
            entry.transition(ResourceState::Invalid);
        }
    }

    fn entry(&self) -> &Entry<R::Instance> {
        self.entry.as_ref().expect("lease used after release")
    }
}

impl<R: Resource> Deref for Lease<R> {
    type Target = R::Instance;

    fn deref(&self) -> &R::Instance {
        &self.entry().instance
    }
}

impl<R: Resource> DerefMut for Lease<R> {
    fn deref_mut(&mut self) -> &mut R::Instance {
        &mut self.entry.as_mut().expect("lease used after release").instance
    }
}

impl<R: Resource> Drop for Lease<R> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            Shared::release(&self.shared, entry);
        }
    }
}

impl<R: Resource> fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.shared.resource.id())
            .field("info", &self.entry.as_ref().map(|e| e.info))
            .finish()
    }
}
