//! Event data model.
//!
//! An [`Event`] is the unit handlers see: a type tag, a JSON payload and
//! routing metadata. Metadata never travels in the encoded body; transports
//! carry it in their own message fields (see [`crate::message`]).
//!
//! # Correlation
//!
//! Requests carry a [`CorrelationId`] and a `reply_to` destination. Replies
//! echo the correlation id. An event without a correlation id is
//! fire-and-forget.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{MessagingError, Result};

/// Opaque identifier linking a request to its reply.
///
/// Fresh ids are UUID v4. Ids received from other services are echoed
/// verbatim, whatever their format.
///
/// # Example
///
/// ```
/// use messaging::CorrelationId;
///
/// let cid = CorrelationId::new();
/// let echoed = CorrelationId::from(cid.as_str());
/// assert_eq!(cid, echoed);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(Arc::from(uuid.to_string()))
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Routing metadata attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMetadata {
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<String>,
    pub headers: HashMap<String, String>,
}

/// A typed message flowing through the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(skip)]
    pub metadata: EventMetadata,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            metadata: EventMetadata::default(),
        }
    }

    /// Event with no payload.
    pub fn named(event_type: impl Into<String>) -> Self {
        Self::new(event_type, Value::Null)
    }

    /// Build an event from any serializable payload.
    pub fn with_payload<T: Serialize>(event_type: impl Into<String>, payload: &T) -> Result<Self> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| MessagingError::Decode(format!("payload not serializable: {e}")))?;
        Ok(Self::new(event_type, payload))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.metadata.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.metadata.reply_to = Some(reply_to.into());
        self
    }

    /// Deserialize the payload into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            MessagingError::Decode(format!("payload of '{}' is invalid: {e}", self.event_type))
        })
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.metadata.correlation_id.as_ref()
    }

    /// Whether a reply is expected for this event.
    pub fn expects_reply(&self) -> bool {
        self.metadata.reply_to.is_some()
    }
}
