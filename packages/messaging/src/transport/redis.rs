//! Redis pub/sub strategy.
//!
//! Destinations are channels. Redis carries only a payload, so each message
//! is framed as one line of JSON routing fields (correlation id, reply
//! channel, headers) followed by the raw body. Frames without a routing
//! line are delivered as a bare body.
//!
//! Publishing goes over a multiplexed connection; every `consume` opens its
//! own subscriber connection. A subscriber connection that ends without
//! `disconnect` is reported as `close`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client, RedisResult};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{pubsub_status, ConnectionHandle, InboundStream, RawStatus, Transport, TransportKind};
use crate::error::{MessagingError, Result};
use crate::message::{InboundMessage, NoAck, TransportMessage};

const STATUS_CAPACITY: usize = 64;

// =============================================================================
// Framing
// =============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Routing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
}

fn encode_frame(message: &TransportMessage) -> serde_json::Result<Vec<u8>> {
    let routing = Routing {
        correlation_id: message.correlation_id.clone(),
        reply_to: message.reply_to.clone(),
        headers: message.headers.clone(),
    };
    let mut frame = serde_json::to_vec(&routing)?;
    frame.push(b'\n');
    frame.extend_from_slice(&message.data);
    Ok(frame)
}

fn decode_frame(frame: &[u8]) -> TransportMessage {
    let routed = frame
        .iter()
        .position(|b| *b == b'\n')
        .and_then(|split| {
            let routing: Routing = serde_json::from_slice(&frame[..split]).ok()?;
            Some((routing, &frame[split + 1..]))
        });

    match routed {
        Some((routing, body)) => TransportMessage {
            data: Bytes::copy_from_slice(body),
            correlation_id: routing.correlation_id,
            reply_to: routing.reply_to,
            headers: routing.headers,
        },
        None => TransportMessage::new(Bytes::copy_from_slice(frame)),
    }
}

// =============================================================================
// Transport
// =============================================================================

#[derive(Clone)]
struct Link {
    client: Client,
    publisher: MultiplexedConnection,
    token: CancellationToken,
}

/// Connection to a Redis server.
pub struct RedisTransport {
    url: String,
    link: Mutex<Option<Link>>,
    status: broadcast::Sender<RawStatus>,
}

impl RedisTransport {
    pub fn new(url: impl Into<String>) -> Self {
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        Self {
            url: url.into(),
            link: Mutex::new(None),
            status,
        }
    }

    fn emit(&self, code: &'static str) {
        let _ = self
            .status
            .send(RawStatus::new(TransportKind::PubSub, code, &self.url));
    }

    fn live(&self) -> Option<Link> {
        self.link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|link| !link.token.is_cancelled())
            .cloned()
    }

    fn lost(&self, token: &CancellationToken, detail: impl ToString) {
        if token.is_cancelled() {
            return;
        }
        token.cancel();
        warn!(host = %self.url, "redis connection lost");
        let _ = self.status.send(
            RawStatus::new(TransportKind::PubSub, pubsub_status::CLOSE, &self.url)
                .with_detail(detail.to_string()),
        );
    }
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PubSub
    }

    fn host(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<ConnectionHandle> {
        let client = Client::open(self.url.as_str())
            .map_err(|e| MessagingError::connection(&self.url, e))?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| MessagingError::connection(&self.url, e))?;
        self.emit(pubsub_status::CONNECT);

        let previous = self
            .link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Link {
                client,
                publisher,
                token: CancellationToken::new(),
            });
        if let Some(old) = previous {
            old.token.cancel();
        }

        self.emit(pubsub_status::READY);
        debug!(host = %self.url, "redis connection opened");
        Ok(ConnectionHandle {
            kind: TransportKind::PubSub,
            host: self.url.clone(),
        })
    }

    async fn disconnect(&self) -> Result<()> {
        let link = self.link.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(link) = link {
            link.token.cancel();
            self.emit(pubsub_status::END);
        }
        Ok(())
    }

    async fn publish(&self, destination: &str, message: TransportMessage) -> Result<()> {
        let link = self
            .live()
            .ok_or_else(|| MessagingError::publish(destination, "connection closed"))?;
        let frame = encode_frame(&message).map_err(|e| MessagingError::publish(destination, e))?;

        trace!(channel = destination, bytes = frame.len(), "publish");
        let mut publisher = link.publisher;
        let published: RedisResult<i64> = publisher.publish(destination, frame).await;
        match published {
            Ok(receivers) => {
                if receivers == 0 {
                    debug!(channel = destination, "published without subscribers");
                }
                Ok(())
            }
            Err(err) => {
                if err.is_connection_dropped() || err.is_io_error() {
                    self.lost(&link.token, &err);
                }
                Err(MessagingError::publish(destination, err))
            }
        }
    }

    async fn consume(&self, destination: &str) -> Result<InboundStream> {
        let link = self
            .live()
            .ok_or_else(|| MessagingError::connection(&self.url, "not connected"))?;
        let mut pubsub = link
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| MessagingError::connection(&self.url, e))?;
        pubsub
            .subscribe(destination)
            .await
            .map_err(|e| MessagingError::connection(&self.url, e))?;
        debug!(channel = destination, "subscribed");

        let messages = pubsub.into_on_message();
        let destination = destination.to_string();
        let token = link.token;
        let status = self.status.clone();
        let host = self.url.clone();

        Ok(Box::pin(stream::unfold(
            (Box::pin(messages), destination, token),
            move |(mut messages, destination, token)| {
                let status = status.clone();
                let host = host.clone();
                async move {
                    let next = tokio::select! {
                        _ = token.cancelled() => return None,
                        next = messages.next() => next,
                    };
                    let Some(msg) = next else {
                        if !token.is_cancelled() {
                            token.cancel();
                            warn!(channel = %destination, "redis subscription ended");
                            let _ = status.send(RawStatus::new(
                                TransportKind::PubSub,
                                pubsub_status::CLOSE,
                                host,
                            ));
                        }
                        return None;
                    };
                    let inbound = InboundMessage::new(
                        destination.clone(),
                        decode_frame(msg.get_payload_bytes()),
                        Box::new(NoAck),
                    );
                    Some((inbound, (messages, destination, token)))
                }
            },
        )))
    }

    async fn reply_destination(&self) -> Result<String> {
        if self.live().is_none() {
            return Err(MessagingError::connection(&self.url, "not connected"));
        }
        Ok(format!("_INBOX.{}", Uuid::new_v4().simple()))
    }

    fn status_stream(&self) -> broadcast::Receiver<RawStatus> {
        self.status.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_carries_routing_fields_and_body() {
        let mut message = TransportMessage::new("{\"type\":\"RPC_TEST\"}\nsecond line");
        message.correlation_id = Some("c-9".to_string());
        message.reply_to = Some("_INBOX.abc".to_string());
        message
            .headers
            .insert("Trace-Id".to_string(), "t-1".to_string());

        let frame = encode_frame(&message).unwrap();
        assert_eq!(decode_frame(&frame), message);
    }

    #[test]
    fn bare_message_frames_with_empty_routing() {
        let frame = encode_frame(&TransportMessage::new("x")).unwrap();
        assert_eq!(frame, b"{}\nx".to_vec());
    }

    #[test]
    fn unframed_payload_is_delivered_whole() {
        let decoded = decode_frame(b"{\"type\":\"EVENT_TEST\"}");
        assert_eq!(decoded.data.as_ref(), b"{\"type\":\"EVENT_TEST\"}");
        assert_eq!(decoded.correlation_id, None);

        let decoded = decode_frame(b"not json\nbody");
        assert_eq!(decoded.data.as_ref(), b"not json\nbody");
    }

    #[tokio::test]
    async fn operations_before_connect_fail() {
        let transport = RedisTransport::new("redis://localhost:6379");

        let err = transport
            .publish("events", TransportMessage::new("x"))
            .await
            .unwrap_err();
        assert_eq!(err.name(), "PublishError");

        let err = transport.reply_destination().await.unwrap_err();
        assert_eq!(err.name(), "ConnectionError");

        assert!(transport.disconnect().await.is_ok());
    }
}
