//! Transport strategies.
//!
//! A [`Transport`] is one connection to one broker. It publishes
//! [`TransportMessage`]s, consumes destinations as streams of
//! [`InboundMessage`]s and reports broker-native status codes on a
//! broadcast stream. Everything above this module is broker-agnostic.
//!
//! | Strategy | Delivery model | Acks |
//! |----------|----------------|------|
//! | [`QueueTransport`] | named queues, competing consumers, FIFO | ack / nack / requeue |
//! | [`PubSubTransport`] | channel fan-out, no persistence | none |
//! | `AmqpTransport` (feature `amqp`) | broker queues over lapin | ack / nack / requeue |
//! | `RedisTransport` (feature `redis`) | Redis channels | none |
//! | `NatsTransport` (feature `nats`) | subjects with queue groups | none |
//!
//! The in-process brokers need no server and back the test suites. The
//! feature-gated strategies report the same status codes as their
//! in-process counterparts (`queue_status` for AMQP, `pubsub_status` for
//! Redis).

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::message::{InboundMessage, TransportMessage};

#[cfg(feature = "amqp")]
pub mod amqp;
mod memory;
#[cfg(feature = "nats")]
pub mod nats;
pub mod pubsub;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "redis")]
pub use self::redis::RedisTransport;
#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
#[cfg(feature = "nats")]
pub use nats::NatsTransport;
pub use pubsub::{PubSubBroker, PubSubTransport};
pub use queue::{QueueBroker, QueueTransport};

/// Stream of deliveries from one destination. Ends when the connection is lost.
pub type InboundStream = BoxStream<'static, InboundMessage>;

/// Which status vocabulary a transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// AMQP-style queue broker.
    Queue,
    /// Redis-style pub/sub broker.
    PubSub,
    Nats,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Queue => write!(f, "queue"),
            TransportKind::PubSub => write!(f, "pubsub"),
            TransportKind::Nats => write!(f, "nats"),
        }
    }
}

/// Status codes of the queue strategy.
pub mod queue_status {
    pub const CONNECTED: &str = "CONNECTED";
    pub const CHANNEL_CONNECTED: &str = "CHANNEL_CONNECTED";
    pub const CONNECTION_LOST: &str = "CONNECTION_LOST";
    pub const CHANNEL_CONNECTION_LOST: &str = "CHANNEL_CONNECTION_LOST";
    pub const CLOSED: &str = "CLOSED";
    pub const ERROR: &str = "ERROR";
}

/// Status codes of the pub/sub strategy.
pub mod pubsub_status {
    pub const CONNECT: &str = "connect";
    pub const READY: &str = "ready";
    pub const RECONNECTING: &str = "reconnecting";
    pub const CLOSE: &str = "close";
    pub const END: &str = "end";
    pub const ERROR: &str = "error";
}

/// Status codes of the NATS strategy.
pub mod nats_status {
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
    pub const CLOSED: &str = "closed";
    pub const ERROR: &str = "error";
}

/// A broker-native status notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawStatus {
    pub kind: TransportKind,
    pub code: &'static str,
    pub host: String,
    pub detail: Option<String>,
}

impl RawStatus {
    pub fn new(kind: TransportKind, code: &'static str, host: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            host: host.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Returned by a successful [`Transport::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub kind: TransportKind,
    pub host: String,
}

/// One connection to a broker.
///
/// Implementations must be usable from several tasks at once; facades share
/// a single instance between their consume loop, monitor and callers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    fn host(&self) -> &str;

    /// Open the connection. On a lost connection this reconnects.
    async fn connect(&self) -> Result<ConnectionHandle>;

    async fn disconnect(&self) -> Result<()>;

    /// Publish and return once the broker accepted the message.
    async fn publish(&self, destination: &str, message: TransportMessage) -> Result<()>;

    /// Start consuming a destination.
    async fn consume(&self, destination: &str) -> Result<InboundStream>;

    /// Create a private destination for replies to this connection.
    async fn reply_destination(&self) -> Result<String>;

    /// Broker-native status codes, for as long as the strategy lives.
    fn status_stream(&self) -> broadcast::Receiver<RawStatus>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn host(&self) -> &str {
        (**self).host()
    }

    async fn connect(&self) -> Result<ConnectionHandle> {
        (**self).connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        (**self).disconnect().await
    }

    async fn publish(&self, destination: &str, message: TransportMessage) -> Result<()> {
        (**self).publish(destination, message).await
    }

    async fn consume(&self, destination: &str) -> Result<InboundStream> {
        (**self).consume(destination).await
    }

    async fn reply_destination(&self) -> Result<String> {
        (**self).reply_destination().await
    }

    fn status_stream(&self) -> broadcast::Receiver<RawStatus> {
        (**self).status_stream()
    }
}
