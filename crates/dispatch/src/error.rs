//! Error types for the dedup store and the dispatcher

use std::fmt;

use herald_pool::Interrupted;
use thiserror::Error;

use crate::driver::DriverError;
use crate::message::Delivery;

/// A message that cannot be dispatched.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Identifier empty or only whitespace
    #[error("identifier must not be blank")]
    BlankIdentifier,

    /// The JSON envelope needs a UTF-8 payload
    #[error("payload is not valid UTF-8")]
    NonUtf8Payload,

    /// Envelope serialization failed
    #[error("failed to encode payload")]
    Encode(#[source] serde_json::Error),
}

/// Dedup store operation, used to label errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Exists,
    Record,
    Remove,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exists => "exists",
            Self::Record => "record",
            Self::Remove => "remove",
        })
    }
}

/// Errors returned by [`DedupStore`](crate::DedupStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// No connection could be leased
    #[error("no store connection available")]
    Pool(#[from] herald_pool::Error),

    /// The driver call failed after a connection was leased
    #[error("store {operation} failed")]
    Unavailable {
        operation: StoreOperation,
        #[source]
        source: DriverError,
    },

    /// The driver call was cut short by cancellation or a deadline
    #[error("store {operation} interrupted: {reason}")]
    Interrupted {
        operation: StoreOperation,
        reason: Interrupted,
    },
}

impl StoreError {
    /// The pool error, when no connection could be leased.
    ///
    /// Tells pool exhaustion apart from a failure to connect.
    pub fn pool_error(&self) -> Option<&herald_pool::Error> {
        match self {
            Self::Pool(e) => Some(e),
            _ => None,
        }
    }
}

/// Why a send failed, without the details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    InvalidMessage,
    StoreUnavailable,
    BrokerUnavailable,
    /// Published, but the identifier was not recorded; a resend will
    /// publish again
    SentButUnrecorded,
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InvalidMessage => "invalid-message",
            Self::StoreUnavailable => "store-unavailable",
            Self::BrokerUnavailable => "broker-unavailable",
            Self::SentButUnrecorded => "sent-but-unrecorded",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Pipeline stage a cancelled send stopped in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Waiting for the identifier lock or checking the store
    Check,
    /// Publishing to the broker
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Check => "check",
            Self::Publish => "publish",
        })
    }
}

/// A failed send.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("message {identifier} cannot be dispatched")]
    InvalidMessage {
        identifier: String,
        #[source]
        source: MessageError,
    },

    /// The existence check failed; nothing was published
    #[error("dedup store unavailable while checking {identifier}")]
    StoreUnavailable {
        identifier: String,
        #[source]
        source: StoreError,
    },

    /// The broker refused or lost the message; nothing was recorded
    #[error("broker unavailable, {identifier} was not sent")]
    BrokerUnavailable {
        identifier: String,
        #[source]
        source: DriverError,
    },

    /// Published, but recording the identifier failed
    #[error("{identifier} was sent but not recorded, a retry will send it again")]
    SentButUnrecorded {
        identifier: String,
        delivery: Delivery,
        #[source]
        source: StoreError,
    },

    #[error("send of {identifier} {reason} during {stage}")]
    Cancelled {
        identifier: String,
        stage: Stage,
        reason: Interrupted,
    },
}

impl DispatchError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::InvalidMessage { .. } => FailureReason::InvalidMessage,
            Self::StoreUnavailable { .. } => FailureReason::StoreUnavailable,
            Self::BrokerUnavailable { .. } => FailureReason::BrokerUnavailable,
            Self::SentButUnrecorded { .. } => FailureReason::SentButUnrecorded,
            Self::Cancelled { .. } => FailureReason::Cancelled,
        }
    }

    pub fn identifier(&self) -> &str {
        match self {
            Self::InvalidMessage { identifier, .. }
            | Self::StoreUnavailable { identifier, .. }
            | Self::BrokerUnavailable { identifier, .. }
            | Self::SentButUnrecorded { identifier, .. }
            | Self::Cancelled { identifier, .. } => identifier,
        }
    }

    /// The pool error behind a store failure, if any.
    pub fn pool_error(&self) -> Option<&herald_pool::Error> {
        match self {
            Self::StoreUnavailable { source, .. } | Self::SentButUnrecorded { source, .. } => {
                source.pool_error()
            }
            _ => None,
        }
    }

    /// Whether the message reached the broker without being recorded.
    pub fn is_duplicate_risk(&self) -> bool {
        matches!(self, Self::SentButUnrecorded { .. })
    }
}

/// Errors from [`Dispatcher::shutdown`](crate::Dispatcher::shutdown).
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("failed to close broker")]
    Broker(#[source] DriverError),

    #[error("failed to shut down dedup store")]
    Store(#[source] StoreError),
}

/// Invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pool configuration")]
    Pool(#[from] herald_pool::Error),

    #[error("invalid {section} configuration: {message}")]
    Invalid {
        section: &'static str,
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(section: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            section,
            message: message.into(),
        }
    }
}
