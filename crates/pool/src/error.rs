//! Error types for pool operations
use std::time::Duration;

use thiserror::Error;

use crate::resource::ResourceId;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error used to carry the underlying cause of a resource failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by [`Pool`](crate::Pool) operations.
///
/// Exhaustion and creation failure are separate variants because the fix
/// differs: the first is a capacity/timeout tuning problem, the second points
/// at the downstream system.
#[derive(Error, Debug)]
pub enum Error {
    /// No resource became available before the acquire deadline
    #[error("pool '{pool}' exhausted: {size}/{max_total} resources in use after waiting {waited:?}")]
    PoolExhausted {
        /// The pool (resource) name
        pool: String,
        /// Live resources at the time of failure
        size: usize,
        /// Configured capacity
        max_total: usize,
        /// How long the caller waited
        waited: Duration,
    },

    /// Creating a new resource failed
    #[error("failed to create resource for pool '{pool}'")]
    ResourceCreationFailed {
        /// The pool (resource) name
        pool: String,
        /// The connect/handshake failure
        #[source]
        source: BoxError,
    },

    /// A resource failed its liveness check.
    ///
    /// Never returned from `acquire`: the resource is discarded and the
    /// acquisition loop carries on. Surfaces through
    /// [`MaintenanceReport`](crate::MaintenanceReport) and logs.
    #[error("resource {id} in pool '{pool}' failed validation")]
    ValidationFailed {
        /// The pool (resource) name
        pool: String,
        /// The discarded resource
        id: ResourceId,
        /// The validation failure
        #[source]
        source: BoxError,
    },

    /// The pool has been shut down
    #[error("pool '{pool}' is closed")]
    PoolClosed {
        /// The pool (resource) name
        pool: String,
    },

    /// The caller's context was cancelled or hit its deadline mid-operation
    #[error("operation on pool '{pool}' was cancelled")]
    Cancelled {
        /// The pool (resource) name
        pool: String,
    },

    /// Shutdown gave up while leases were still outstanding
    #[error("shutdown of pool '{pool}' interrupted with {outstanding} resources still leased")]
    ShutdownTimeout {
        /// The pool (resource) name
        pool: String,
        /// Leases not yet released
        outstanding: usize,
    },

    /// Pool configuration is invalid
    #[error("configuration error: {message}")]
    Configuration {
        /// What is wrong with the configuration
        message: String,
    },
}

/// Discriminant of [`Error`] for programmatic branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::PoolExhausted`]
    PoolExhausted,
    /// See [`Error::ResourceCreationFailed`]
    ResourceCreationFailed,
    /// See [`Error::ValidationFailed`]
    ValidationFailed,
    /// See [`Error::PoolClosed`]
    PoolClosed,
    /// See [`Error::Cancelled`]
    Cancelled,
    /// See [`Error::ShutdownTimeout`]
    ShutdownTimeout,
    /// See [`Error::Configuration`]
    Configuration,
}

impl Error {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Wrap a resource creation failure
    pub fn creation<E>(pool: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::ResourceCreationFailed {
            pool: pool.into(),
            source: source.into(),
        }
    }

    /// The kind of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::ResourceCreationFailed { .. } => ErrorKind::ResourceCreationFailed,
            Self::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            Self::PoolClosed { .. } => ErrorKind::PoolClosed,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::ShutdownTimeout { .. } => ErrorKind::ShutdownTimeout,
            Self::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// Check if this error is retryable
    ///
    /// Exhaustion usually clears within milliseconds; creation failures may
    /// need a longer backoff. Both are left to the caller.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::ResourceCreationFailed { .. }
        )
    }

    /// Get the pool name associated with this error (if any)
    #[must_use]
    pub fn pool(&self) -> Option<&str> {
        match self {
            Self::Configuration { .. } => None,
            Self::PoolExhausted { pool, .. }
            | Self::ResourceCreationFailed { pool, .. }
            | Self::ValidationFailed { pool, .. }
            | Self::PoolClosed { pool }
            | Self::Cancelled { pool }
            | Self::ShutdownTimeout { pool, .. } => Some(pool),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_and_creation_have_distinct_kinds() {
        let exhausted = Error::PoolExhausted {
            pool: "store".into(),
            size: 2,
            max_total: 2,
            waited: Duration::from_millis(50),
        };
        let creation = Error::creation("store", std::io::Error::other("refused"));

        assert_eq!(exhausted.kind(), ErrorKind::PoolExhausted);
        assert_eq!(creation.kind(), ErrorKind::ResourceCreationFailed);
        assert!(exhausted.is_retryable());
        assert!(creation.is_retryable());
    }

    #[test]
    fn creation_failure_keeps_source() {
        let err = Error::creation("store", std::io::Error::other("connection refused"));
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "connection refused");
    }

    #[test]
    fn closed_and_cancelled_are_not_retryable() {
        assert!(!Error::PoolClosed { pool: "p".into() }.is_retryable());
        assert!(!Error::Cancelled { pool: "p".into() }.is_retryable());
        assert_eq!(Error::configuration("bad").pool(), None);
    }
}
