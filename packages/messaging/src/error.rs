//! Error taxonomy for the messaging runtime.
//!
//! `MessagingError` is the only error type returned from facade operations
//! and the only error carried on the status stream. Handler code works with
//! `anyhow::Result`; the listener converts those at the boundary into
//! [`MessagingError::Handler`].
//!
//! # Propagation
//!
//! | Kind | Surfaces to |
//! |------|-------------|
//! | `Connection` | caller of `run()`/`connect()`; status stream during reconnects |
//! | `Publish` | caller of `send_message`/`emit_message`; status stream for replies |
//! | `Decode` | status stream only, message is nacked |
//! | `Handler` | status stream only, message is nacked |
//! | `Timeout` | caller of `send_message` |
//! | `Shutdown` | caller of `close()` |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::CorrelationId;

/// Errors produced by transports, the pipeline and the facades.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// Broker unreachable or connection refused.
    #[error("connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    /// The transport refused a publish, usually because the channel is closed.
    #[error("publish to '{destination}' failed: {message}")]
    Publish {
        destination: String,
        message: String,
    },

    /// Inbound bytes could not be turned into an event.
    #[error("failed to decode message: {0}")]
    Decode(String),

    /// An effect failed, rejected its input or panicked.
    #[error("handler for '{event_type}' failed: {message}")]
    Handler { event_type: String, message: String },

    /// No reply arrived before the request deadline.
    #[error("no reply for correlation {correlation_id} within {duration:?}")]
    Timeout {
        correlation_id: CorrelationId,
        duration: Duration,
    },

    /// `close()` could not finish within its deadline.
    #[error("shutdown did not complete: {message}")]
    Shutdown { message: String },

    /// A request was registered under an id that is already pending.
    #[error("correlation {0} is already pending")]
    DuplicateCorrelation(CorrelationId),
}

impl MessagingError {
    /// Stable kind name, as reported in [`ErrorInfo::name`].
    pub fn name(&self) -> &'static str {
        match self {
            MessagingError::Connection { .. } => "ConnectionError",
            MessagingError::Publish { .. } => "PublishError",
            MessagingError::Decode(_) => "DecodeError",
            MessagingError::Handler { .. } => "HandlerError",
            MessagingError::Timeout { .. } => "Timeout",
            MessagingError::Shutdown { .. } => "ShutdownError",
            MessagingError::DuplicateCorrelation(_) => "DuplicateCorrelation",
        }
    }

    pub(crate) fn connection(host: impl Into<String>, message: impl ToString) -> Self {
        MessagingError::Connection {
            host: host.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn publish(destination: impl Into<String>, message: impl ToString) -> Self {
        MessagingError::Publish {
            destination: destination.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn handler(event_type: impl Into<String>, message: impl ToString) -> Self {
        MessagingError::Handler {
            event_type: event_type.into(),
            message: message.to_string(),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = MessagingError> = std::result::Result<T, E>;

/// Serializable `{ name, message }` pair carried by error status events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<&MessagingError> for ErrorInfo {
    fn from(err: &MessagingError) -> Self {
        Self {
            name: err.name().to_string(),
            message: err.to_string(),
        }
    }
}
