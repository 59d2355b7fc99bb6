//! Store and broker driver interfaces
//!
//! The dispatcher never speaks a wire protocol itself. A [`StoreDriver`]
//! opens connections to the key-value store (the pool owns them), and a
//! [`BrokerDriver`] publishes payloads. Every call takes a [`Context`]; the
//! caller bounds it, drivers may use it for their own deadlines.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use herald_pool::{BoxError, Context};
use thiserror::Error;

use crate::message::Delivery;

/// Failure reported by a store or broker driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The connection could not be established or was lost
    #[error("connection error: {message}")]
    Connection {
        /// What happened
        message: String,
        /// Underlying client error
        #[source]
        source: Option<BoxError>,
    },

    /// The remote side did not answer in time
    #[error("timed out: {message}")]
    Timeout {
        /// What happened
        message: String,
        /// Underlying client error
        #[source]
        source: Option<BoxError>,
    },

    /// The remote side answered with an error
    #[error("rejected: {message}")]
    Rejected {
        /// What happened
        message: String,
        /// Underlying client error
        #[source]
        source: Option<BoxError>,
    },

    /// The reply could not be understood
    #[error("protocol error: {message}")]
    Protocol {
        /// What happened
        message: String,
        /// Underlying client error
        #[source]
        source: Option<BoxError>,
    },
}

impl DriverError {
    /// Connection lost or refused.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// No answer in time.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            source: None,
        }
    }

    /// Error reply from the remote side.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
            source: None,
        }
    }

    /// Unexpected reply.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying client error.
    #[must_use]
    pub fn with_source(mut self, error: impl Into<BoxError>) -> Self {
        let slot = match &mut self {
            Self::Connection { source, .. }
            | Self::Timeout { source, .. }
            | Self::Rejected { source, .. }
            | Self::Protocol { source, .. } => source,
        };
        *slot = Some(error.into());
        self
    }

    /// Whether the connection that produced this error is in an unknown
    /// state and must not go back to the pool.
    ///
    /// Only a well-formed error reply leaves the connection usable.
    pub fn is_connection(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    /// The message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Connection { message, .. }
            | Self::Timeout { message, .. }
            | Self::Rejected { message, .. }
            | Self::Protocol { message, .. } => message,
        }
    }
}

/// Opens connections to the dedup key-value store.
///
/// Implementations are wrapped into a pooled resource; `connect` runs when
/// the pool grows and must not retry internally.
pub trait StoreDriver: Send + Sync + 'static {
    /// A live connection. Owned by the pool, leased per operation.
    type Connection: StoreConnection;

    /// Name used as the pool name in errors and logs.
    fn name(&self) -> &str;

    /// Open a new connection.
    fn connect(
        &self,
        ctx: &Context,
    ) -> impl Future<Output = Result<Self::Connection, DriverError>> + Send;
}

/// One connection to the key-value store.
pub trait StoreConnection: Send + 'static {
    /// Liveness check, used for borrow-time and idle validation.
    fn ping(&mut self, ctx: &Context) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Read a key. `None` if absent or expired.
    fn get(
        &mut self,
        ctx: &Context,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, DriverError>> + Send;

    /// Write a key with an expiry, overwriting any previous value.
    fn set(
        &mut self,
        ctx: &Context,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Delete a key. Returns whether it existed.
    fn del(
        &mut self,
        ctx: &Context,
        key: &str,
    ) -> impl Future<Output = Result<bool, DriverError>> + Send;

    /// Cheap check on release; a broken connection is destroyed.
    fn is_broken(&self) -> bool {
        false
    }
}

/// Publishes payloads to the downstream broker.
pub trait BrokerDriver: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Publish `payload` under `key` and wait for the acknowledgement.
    fn publish(
        &self,
        ctx: &Context,
        key: &str,
        payload: Bytes,
    ) -> impl Future<Output = Result<Delivery, DriverError>> + Send;

    /// Flush pending sends and release client resources.
    fn close(&self, ctx: &Context) -> impl Future<Output = Result<(), DriverError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn only_rejections_keep_the_connection() {
        assert!(DriverError::connection("reset").is_connection());
        assert!(DriverError::timeout("slow").is_connection());
        assert!(DriverError::protocol("garbled").is_connection());
        assert!(!DriverError::rejected("WRONGTYPE").is_connection());
    }

    #[test]
    fn with_source_is_exposed_as_error_source() {
        let err = DriverError::connection("connect failed")
            .with_source(std::io::Error::other("connection refused"));
        assert_eq!(err.to_string(), "connection error: connect failed");
        assert_eq!(err.message(), "connect failed");
        assert_eq!(err.source().unwrap().to_string(), "connection refused");
    }
}
