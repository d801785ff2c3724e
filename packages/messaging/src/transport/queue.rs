//! AMQP-style queue strategy.
//!
//! [`QueueBroker`] is an in-process broker with named queues. Queues are
//! declared on first publish or consume. Each queue delivers in FIFO order
//! to competing consumers; a delivery stays owned by its consumer until it
//! is acked, nacked, or dropped (which requeues it, like a closed channel).
//!
//! [`QueueTransport`] is one connection to a broker. Reply queues it
//! declares outlive connection loss and are deleted on `disconnect`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use super::memory::{ConnectionTable, Session, SessionCodes};
use super::{queue_status, ConnectionHandle, InboundStream, RawStatus, Transport, TransportKind};
use crate::config::QueueOptions;
use crate::error::{MessagingError, Result};
use crate::message::{Acknowledger, InboundMessage, TransportMessage};

const CODES: SessionCodes = SessionCodes {
    connected: &[queue_status::CONNECTED, queue_status::CHANNEL_CONNECTED],
    lost: &[
        queue_status::CHANNEL_CONNECTION_LOST,
        queue_status::CONNECTION_LOST,
    ],
    closed: queue_status::CLOSED,
};

// =============================================================================
// Broker
// =============================================================================

struct Envelope {
    message: TransportMessage,
    redelivered: bool,
}

struct Queue {
    name: String,
    durable: bool,
    backlog: Mutex<VecDeque<Envelope>>,
    ready: Notify,
}

impl Queue {
    fn new(name: &str, durable: bool) -> Self {
        Self {
            name: name.to_string(),
            durable,
            backlog: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    fn push(&self, message: TransportMessage, redelivered: bool) {
        self.backlog
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Envelope {
                message,
                redelivered,
            });
        // Every waiting consumer rechecks; one that is no longer polled
        // cannot swallow the wakeup.
        self.ready.notify_waiters();
    }

    fn pop(&self) -> Option<Envelope> {
        self.backlog
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn depth(&self) -> usize {
        self.backlog.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Wait for the next message. No lock is held while waiting.
    async fn next(&self) -> Envelope {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(envelope) = self.pop() {
                return envelope;
            }
            notified.await;
        }
    }
}

struct BrokerInner {
    host: String,
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    connections: Arc<ConnectionTable>,
}

/// In-process queue broker.
#[derive(Clone)]
pub struct QueueBroker {
    inner: Arc<BrokerInner>,
}

impl QueueBroker {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                host: host.into(),
                queues: Mutex::new(HashMap::new()),
                connections: Arc::new(ConnectionTable::new()),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    fn declare(&self, name: &str, options: &QueueOptions) -> Arc<Queue> {
        let mut queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(queue = name, durable = options.durable, "queue declared");
                Arc::new(Queue::new(name, options.durable))
            })
            .clone()
    }

    /// Messages waiting in a queue, not counting unsettled deliveries.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|queue| queue.depth())
            .unwrap_or(0)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    fn delete(&self, name: &str) {
        if self
            .inner
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
        {
            debug!(queue = name, "queue deleted");
        }
    }

    /// Sever every client connection. Queues and their contents survive.
    pub fn drop_connections(&self) -> usize {
        self.inner.connections.drop_all()
    }

    /// While unavailable, connection attempts fail.
    pub fn set_available(&self, available: bool) {
        self.inner.connections.set_available(available);
    }

    pub fn live_connections(&self) -> usize {
        self.inner.connections.live_count()
    }

    /// Drop all connections and discard non-durable queues.
    pub fn restart(&self) {
        self.drop_connections();
        let mut queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.retain(|_, queue| queue.durable);
        debug!(remaining = queues.len(), "broker restarted");
    }
}

impl std::fmt::Debug for QueueBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueBroker")
            .field("host", &self.inner.host)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Acknowledgment
// =============================================================================

struct QueueAck {
    queue: Arc<Queue>,
    pending: Option<TransportMessage>,
}

#[async_trait]
impl Acknowledger for QueueAck {
    async fn ack(mut self: Box<Self>) -> Result<()> {
        self.pending = None;
        Ok(())
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> Result<()> {
        if let Some(message) = self.pending.take() {
            if requeue {
                self.queue.push(message, true);
            } else {
                debug!(queue = %self.queue.name, "message rejected without requeue");
            }
        }
        Ok(())
    }
}

impl Drop for QueueAck {
    fn drop(&mut self) {
        if let Some(message) = self.pending.take() {
            trace!(queue = %self.queue.name, "unsettled delivery requeued");
            self.queue.push(message, true);
        }
    }
}

fn delivery_stream(queue: Arc<Queue>, destination: String, token: CancellationToken) -> InboundStream {
    Box::pin(stream::unfold(
        (queue, destination, token),
        |(queue, destination, token)| async move {
            let envelope = tokio::select! {
                _ = token.cancelled() => None,
                envelope = queue.next() => Some(envelope),
            };
            let envelope = envelope?;

            let ack = QueueAck {
                queue: queue.clone(),
                pending: Some(envelope.message.clone()),
            };
            let inbound = InboundMessage::new(destination.clone(), envelope.message, Box::new(ack))
                .redelivered(envelope.redelivered);
            Some((inbound, (queue, destination, token)))
        },
    ))
}

// =============================================================================
// Transport
// =============================================================================

/// Connection to a [`QueueBroker`].
pub struct QueueTransport {
    broker: QueueBroker,
    session: Session,
    options: QueueOptions,
    reply_queues: Mutex<Vec<String>>,
}

impl QueueTransport {
    pub fn new(broker: &QueueBroker) -> Self {
        Self {
            broker: broker.clone(),
            session: Session::new(
                TransportKind::Queue,
                broker.host(),
                broker.inner.connections.clone(),
                CODES,
            ),
            options: QueueOptions::default(),
            reply_queues: Mutex::new(Vec::new()),
        }
    }

    /// Options applied to queues this connection declares.
    pub fn with_options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl Transport for QueueTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Queue
    }

    fn host(&self) -> &str {
        self.session.host()
    }

    async fn connect(&self) -> Result<ConnectionHandle> {
        self.session.connect()
    }

    async fn disconnect(&self) -> Result<()> {
        self.session.disconnect();
        let reply_queues =
            std::mem::take(&mut *self.reply_queues.lock().unwrap_or_else(|e| e.into_inner()));
        for name in reply_queues {
            self.broker.delete(&name);
        }
        Ok(())
    }

    async fn publish(&self, destination: &str, message: TransportMessage) -> Result<()> {
        if self.session.live().is_none() {
            return Err(MessagingError::publish(destination, "channel closed"));
        }
        trace!(queue = destination, bytes = message.data.len(), "publish");
        self.broker
            .declare(destination, &self.options)
            .push(message, false);
        Ok(())
    }

    async fn consume(&self, destination: &str) -> Result<InboundStream> {
        let token = self
            .session
            .live()
            .ok_or_else(|| MessagingError::connection(self.session.host(), "not connected"))?;
        let queue = self.broker.declare(destination, &self.options);
        debug!(queue = destination, "consumer attached");
        Ok(delivery_stream(queue, destination.to_string(), token))
    }

    async fn reply_destination(&self) -> Result<String> {
        if self.session.live().is_none() {
            return Err(MessagingError::connection(self.session.host(), "not connected"));
        }
        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        self.broker.declare(&name, &QueueOptions { durable: false });
        self.reply_queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(name.clone());
        Ok(name)
    }

    fn status_stream(&self) -> broadcast::Receiver<RawStatus> {
        self.session.subscribe()
    }
}
