//! Redis-style pub/sub strategy.
//!
//! Every live subscriber of a channel receives every message published to
//! it while subscribed. Nothing is stored: a message published to a channel
//! without subscribers is gone. There are no acknowledgments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::memory::{ConnectionTable, Session, SessionCodes};
use super::{pubsub_status, ConnectionHandle, InboundStream, RawStatus, Transport, TransportKind};
use crate::error::{MessagingError, Result};
use crate::message::{InboundMessage, NoAck, TransportMessage};

const CODES: SessionCodes = SessionCodes {
    connected: &[pubsub_status::CONNECT, pubsub_status::READY],
    lost: &[pubsub_status::CLOSE],
    closed: pubsub_status::END,
};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

struct BrokerInner {
    host: String,
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<TransportMessage>>>,
    connections: Arc<ConnectionTable>,
}

/// In-process pub/sub broker.
#[derive(Clone)]
pub struct PubSubBroker {
    inner: Arc<BrokerInner>,
}

impl PubSubBroker {
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_capacity(host, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Broker whose subscribers lag after `capacity` undelivered messages.
    pub fn with_capacity(host: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                host: host.into(),
                capacity: capacity.max(1),
                channels: Mutex::new(HashMap::new()),
                connections: Arc::new(ConnectionTable::new()),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    fn channel(&self, name: &str) -> broadcast::Sender<TransportMessage> {
        let mut channels = self.inner.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .clone()
    }

    /// Live subscribers of a channel.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn drop_connections(&self) -> usize {
        self.inner.connections.drop_all()
    }

    pub fn set_available(&self, available: bool) {
        self.inner.connections.set_available(available);
    }

    pub fn live_connections(&self) -> usize {
        self.inner.connections.live_count()
    }
}

impl std::fmt::Debug for PubSubBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubBroker")
            .field("host", &self.inner.host)
            .finish_non_exhaustive()
    }
}

fn subscription_stream(
    rx: broadcast::Receiver<TransportMessage>,
    destination: String,
    token: CancellationToken,
) -> InboundStream {
    Box::pin(stream::unfold(
        (rx, destination, token),
        |(mut rx, destination, token)| async move {
            loop {
                let received = tokio::select! {
                    _ = token.cancelled() => return None,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(message) => {
                        let inbound = InboundMessage::new(destination.clone(), message, Box::new(NoAck));
                        return Some((inbound, (rx, destination, token)));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(channel = %destination, skipped, "subscriber lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        },
    ))
}

/// Connection to a [`PubSubBroker`].
pub struct PubSubTransport {
    broker: PubSubBroker,
    session: Session,
}

impl PubSubTransport {
    pub fn new(broker: &PubSubBroker) -> Self {
        Self {
            broker: broker.clone(),
            session: Session::new(
                TransportKind::PubSub,
                broker.host(),
                broker.inner.connections.clone(),
                CODES,
            ),
        }
    }
}

#[async_trait]
impl Transport for PubSubTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PubSub
    }

    fn host(&self) -> &str {
        self.session.host()
    }

    async fn connect(&self) -> Result<ConnectionHandle> {
        self.session.connect()
    }

    async fn disconnect(&self) -> Result<()> {
        self.session.disconnect();
        Ok(())
    }

    async fn publish(&self, destination: &str, message: TransportMessage) -> Result<()> {
        if self.session.live().is_none() {
            return Err(MessagingError::publish(destination, "connection closed"));
        }
        let receivers = self.broker.channel(destination).send(message).unwrap_or(0);
        trace!(channel = destination, receivers, "publish");
        Ok(())
    }

    async fn consume(&self, destination: &str) -> Result<InboundStream> {
        let token = self
            .session
            .live()
            .ok_or_else(|| MessagingError::connection(self.session.host(), "not connected"))?;
        let rx = self.broker.channel(destination).subscribe();
        debug!(channel = destination, "subscribed");
        Ok(subscription_stream(rx, destination.to_string(), token))
    }

    async fn reply_destination(&self) -> Result<String> {
        if self.session.live().is_none() {
            return Err(MessagingError::connection(self.session.host(), "not connected"));
        }
        Ok(format!("_INBOX.{}", Uuid::new_v4().simple()))
    }

    fn status_stream(&self) -> broadcast::Receiver<RawStatus> {
        self.session.subscribe()
    }
}
