//! AMQP strategy over lapin.
//!
//! Destinations are queues on the default exchange. Queues are declared on
//! first publish or consume with the configured [`QueueOptions`]. Deliveries
//! are acked and nacked through the broker. The correlation id and reply
//! queue travel in the message properties.
//!
//! Reply queues are named by this transport, survive reconnects and are
//! deleted on [`Transport::disconnect`]. The connection does not recover on
//! its own: loss is reported as `CHANNEL_CONNECTION_LOST` then
//! `CONNECTION_LOST` and the monitor reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, StreamExt};
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{queue_status, ConnectionHandle, InboundStream, RawStatus, Transport, TransportKind};
use crate::config::QueueOptions;
use crate::error::{MessagingError, Result};
use crate::message::{Acknowledger, InboundMessage, TransportMessage};

/// Prefix of the reply queues this transport declares.
pub const REPLY_QUEUE_PREFIX: &str = "messaging.reply.";

const STATUS_CAPACITY: usize = 64;

#[derive(Clone)]
struct Link {
    connection: Arc<Connection>,
    channel: Channel,
    token: CancellationToken,
}

/// Connection to an AMQP 0.9.1 broker.
pub struct AmqpTransport {
    url: String,
    options: QueueOptions,
    link: Mutex<Option<Link>>,
    reply_queues: Mutex<Vec<String>>,
    status: broadcast::Sender<RawStatus>,
}

impl AmqpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        Self {
            url: url.into(),
            options: QueueOptions::default(),
            link: Mutex::new(None),
            reply_queues: Mutex::new(Vec::new()),
            status,
        }
    }

    /// Options applied to queues this connection declares.
    pub fn with_options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    fn emit(&self, code: &'static str) {
        let _ = self
            .status
            .send(RawStatus::new(TransportKind::Queue, code, &self.url));
    }

    fn live(&self) -> Option<Link> {
        self.link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|link| !link.token.is_cancelled())
            .cloned()
    }

    async fn declare(&self, channel: &Channel, name: &str) -> lapin::Result<()> {
        // Reply queues belong to the client that named them
        if name.starts_with(REPLY_QUEUE_PREFIX) {
            return Ok(());
        }
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: self.options.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for AmqpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpTransport")
            .field("url", &self.url)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Message mapping
// =============================================================================

fn to_properties(message: &TransportMessage) -> BasicProperties {
    let mut properties = BasicProperties::default();
    if let Some(cid) = &message.correlation_id {
        properties = properties.with_correlation_id(cid.clone().into());
    }
    if let Some(reply_to) = &message.reply_to {
        properties = properties.with_reply_to(reply_to.clone().into());
    }
    if !message.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &message.headers {
            table.insert(key.clone().into(), AMQPValue::LongString(value.clone().into()));
        }
        properties = properties.with_headers(table);
    }
    properties
}

fn from_properties(data: Vec<u8>, properties: &BasicProperties) -> TransportMessage {
    let mut headers = HashMap::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => continue,
            };
            headers.insert(key.as_str().to_string(), value);
        }
    }

    TransportMessage {
        data: Bytes::from(data),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|cid| cid.as_str().to_string()),
        reply_to: properties
            .reply_to()
            .as_ref()
            .map(|reply| reply.as_str().to_string()),
        headers,
    }
}

// =============================================================================
// Acknowledgment
// =============================================================================

struct AmqpAck {
    host: String,
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::connection(&self.host, e))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::connection(&self.host, e))
    }
}

fn inbound(destination: &str, host: &str, delivery: Delivery) -> InboundMessage {
    let Delivery {
        data,
        properties,
        acker,
        redelivered,
        ..
    } = delivery;
    let message = from_properties(data, &properties);
    let ack = AmqpAck {
        host: host.to_string(),
        acker,
    };
    InboundMessage::new(destination, message, Box::new(ack)).redelivered(redelivered)
}

// =============================================================================
// Transport
// =============================================================================

#[async_trait]
impl Transport for AmqpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Queue
    }

    fn host(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<ConnectionHandle> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| MessagingError::connection(&self.url, e))?;
        self.emit(queue_status::CONNECTED);

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| MessagingError::connection(&self.url, e))?;
        self.emit(queue_status::CHANNEL_CONNECTED);

        let token = CancellationToken::new();
        {
            let status = self.status.clone();
            let host = self.url.clone();
            let token = token.clone();
            connection.on_error(move |err| {
                if token.is_cancelled() {
                    return;
                }
                token.cancel();
                warn!(host = %host, error = %err, "amqp connection lost");
                let _ = status.send(
                    RawStatus::new(TransportKind::Queue, queue_status::CHANNEL_CONNECTION_LOST, &host)
                        .with_detail(err.to_string()),
                );
                let _ = status.send(RawStatus::new(
                    TransportKind::Queue,
                    queue_status::CONNECTION_LOST,
                    &host,
                ));
            });
        }

        let previous = self
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Link {
                connection: Arc::new(connection),
                channel,
                token,
            });
        if let Some(old) = previous {
            old.token.cancel();
            if let Err(err) = old.connection.close(200, "reconnected").await {
                debug!(error = %err, "closing superseded amqp connection failed");
            }
        }

        debug!(host = %self.url, "amqp connection opened");
        Ok(ConnectionHandle {
            kind: TransportKind::Queue,
            host: self.url.clone(),
        })
    }

    async fn disconnect(&self) -> Result<()> {
        let link = self.link.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(link) = link else {
            return Ok(());
        };
        link.token.cancel();

        let reply_queues =
            std::mem::take(&mut *self.reply_queues.lock().unwrap_or_else(|e| e.into_inner()));
        for name in reply_queues {
            if let Err(err) = link
                .channel
                .queue_delete(&name, QueueDeleteOptions::default())
                .await
            {
                warn!(queue = %name, error = %err, "failed to delete reply queue");
            }
        }

        let closed = link.connection.close(200, "OK").await;
        self.emit(queue_status::CLOSED);
        closed.map_err(|e| MessagingError::connection(&self.url, e))
    }

    async fn publish(&self, destination: &str, message: TransportMessage) -> Result<()> {
        let link = self
            .live()
            .ok_or_else(|| MessagingError::publish(destination, "channel closed"))?;
        self.declare(&link.channel, destination)
            .await
            .map_err(|e| MessagingError::publish(destination, e))?;

        trace!(queue = destination, bytes = message.data.len(), "publish");
        link.channel
            .basic_publish(
                "",
                destination,
                BasicPublishOptions::default(),
                &message.data,
                to_properties(&message),
            )
            .await
            .map_err(|e| MessagingError::publish(destination, e))?
            .await
            .map_err(|e| MessagingError::publish(destination, e))?;
        Ok(())
    }

    async fn consume(&self, destination: &str) -> Result<InboundStream> {
        let link = self
            .live()
            .ok_or_else(|| MessagingError::connection(&self.url, "not connected"))?;
        self.declare(&link.channel, destination)
            .await
            .map_err(|e| MessagingError::connection(&self.url, e))?;

        let consumer = link
            .channel
            .basic_consume(
                destination,
                &format!("messaging-{}", Uuid::new_v4().simple()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::connection(&self.url, e))?;
        debug!(queue = destination, "consumer attached");

        let destination = destination.to_string();
        let host = self.url.clone();
        let token = link.token;
        Ok(Box::pin(
            consumer
                .take_until(async move { token.cancelled().await })
                .take_while(|delivery| future::ready(delivery.is_ok()))
                .filter_map(|delivery| future::ready(delivery.ok()))
                .map(move |delivery| inbound(&destination, &host, delivery)),
        ))
    }

    async fn reply_destination(&self) -> Result<String> {
        let link = self
            .live()
            .ok_or_else(|| MessagingError::connection(&self.url, "not connected"))?;
        let name = format!("{REPLY_QUEUE_PREFIX}{}", Uuid::new_v4().simple());
        link.channel
            .queue_declare(&name, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| MessagingError::connection(&self.url, e))?;
        self.reply_queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(name.clone());
        Ok(name)
    }

    fn status_stream(&self) -> broadcast::Receiver<RawStatus> {
        self.status.subscribe()
    }
}
