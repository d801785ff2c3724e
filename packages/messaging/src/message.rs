//! Transport-level messages and acknowledgment.
//!
//! A [`TransportMessage`] is what crosses the broker: an encoded body plus
//! the protocol fields that carry correlation and reply routing. Inbound
//! messages arrive as [`InboundMessage`], which owns the broker's ack
//! capability until the listener settles it.
//!
//! Settlement is enforced by ownership: [`Delivery::ack`] and
//! [`Delivery::nack`] consume the delivery, so a message can be settled at
//! most once.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Bytes plus routing fields, as carried by a transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMessage {
    pub data: Bytes,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: HashMap<String, String>,
}

impl TransportMessage {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }
}

/// Broker-side settlement of a single delivery.
///
/// Implemented by each transport. Both methods consume the acknowledger.
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(self: Box<Self>) -> Result<()>;

    async fn nack(self: Box<Self>, requeue: bool) -> Result<()>;
}

/// Acknowledger for transports without broker acknowledgments (pub/sub).
#[derive(Debug, Default)]
pub struct NoAck;

#[async_trait]
impl Acknowledger for NoAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn nack(self: Box<Self>, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

/// A message received from a destination, not yet settled.
pub struct InboundMessage {
    destination: String,
    message: TransportMessage,
    redelivered: bool,
    received_at: DateTime<Utc>,
    acker: Box<dyn Acknowledger>,
}

impl InboundMessage {
    pub fn new(
        destination: impl Into<String>,
        message: TransportMessage,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            destination: destination.into(),
            message,
            redelivered: false,
            received_at: Utc::now(),
            acker,
        }
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn message(&self) -> &TransportMessage {
        &self.message
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Split into the message body and its settlement handle.
    pub fn into_parts(self) -> (TransportMessage, Delivery) {
        (
            self.message,
            Delivery {
                destination: self.destination,
                acker: self.acker,
            },
        )
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("destination", &self.destination)
            .field("correlation_id", &self.message.correlation_id)
            .field("redelivered", &self.redelivered)
            .field("received_at", &self.received_at)
            .finish_non_exhaustive()
    }
}

/// Settlement handle split off an [`InboundMessage`].
pub struct Delivery {
    destination: String,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}
