//! Messages, broker acknowledgements and dedup records

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MessageError;

/// A unit of work to dispatch.
///
/// The identifier is the dedup key and the broker key. A message is
/// immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    identifier: String,
    payload: Bytes,
    created_at: DateTime<Utc>,
}

impl Message {
    /// Build a message with a fresh random (v4 UUID) identifier.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            identifier: Uuid::new_v4().to_string(),
            payload: payload.into(),
            created_at: Utc::now(),
        }
    }

    /// Build a message with a caller-chosen identifier.
    ///
    /// # Errors
    /// [`MessageError::BlankIdentifier`] if the identifier is empty or only
    /// whitespace.
    pub fn with_identifier(
        identifier: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<Self, MessageError> {
        let identifier = identifier.into();
        if identifier.trim().is_empty() {
            return Err(MessageError::BlankIdentifier);
        }
        Ok(Self {
            identifier,
            payload: payload.into(),
            created_at: Utc::now(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Render the bytes handed to the broker.
    pub(crate) fn encode(&self, encoding: PayloadEncoding) -> Result<Bytes, MessageError> {
        match encoding {
            PayloadEncoding::Raw => Ok(self.payload.clone()),
            PayloadEncoding::JsonEnvelope => {
                let content =
                    std::str::from_utf8(&self.payload).map_err(|_| MessageError::NonUtf8Payload)?;
                let envelope = Envelope {
                    uuid: &self.identifier,
                    content,
                    timestamp: self.created_at.timestamp_millis(),
                };
                serde_json::to_vec(&envelope)
                    .map(Bytes::from)
                    .map_err(MessageError::Encode)
            }
        }
    }
}

/// How a message is rendered for the broker. The broker key is always the
/// identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    /// Payload bytes as-is
    #[default]
    Raw,
    /// `{"uuid": .., "content": .., "timestamp": <epoch ms>}`; the payload
    /// must be UTF-8
    JsonEnvelope,
}

#[derive(Serialize)]
struct Envelope<'a> {
    uuid: &'a str,
    content: &'a str,
    timestamp: i64,
}

/// Broker acknowledgement metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Delivery {
    pub partition: Option<i32>,
    pub offset: Option<i64>,
}

/// A recorded identifier. Never mutated; expires with the store TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupRecord {
    pub identifier: String,
    pub recorded_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl DedupRecord {
    /// Value written under the record's key.
    pub(crate) fn stored_value(&self) -> String {
        self.recorded_at.timestamp_millis().to_string()
    }
}
