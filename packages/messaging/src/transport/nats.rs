//! NATS strategy.
//!
//! Destinations are subjects. Consumers join a queue group named after the
//! subject, so several servers on one subject compete for messages. Replies
//! use NATS reply subjects; the correlation id travels in a header.
//!
//! The client reconnects on its own, so loss is reported as
//! `disconnected` followed by `connected` once the client is back.

use std::sync::Mutex;

use async_nats::HeaderMap;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{nats_status, ConnectionHandle, InboundStream, RawStatus, Transport, TransportKind};
use crate::error::{MessagingError, Result};
use crate::message::{InboundMessage, NoAck, TransportMessage};

/// Header carrying the correlation id.
pub const CORRELATION_HEADER: &str = "Messaging-Correlation-Id";

const STATUS_CAPACITY: usize = 64;

/// Connection to a NATS server.
pub struct NatsTransport {
    url: String,
    client: Mutex<Option<async_nats::Client>>,
    status: broadcast::Sender<RawStatus>,
}

impl NatsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        Self {
            url: url.into(),
            client: Mutex::new(None),
            status,
        }
    }

    fn client(&self) -> Option<async_nats::Client> {
        self.client.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn emit(&self, code: &'static str) {
        let _ = self
            .status
            .send(RawStatus::new(TransportKind::Nats, code, &self.url));
    }
}

fn to_headers(message: &TransportMessage) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (key, value) in &message.headers {
        headers.insert(key.as_str(), value.as_str());
    }
    if let Some(cid) = &message.correlation_id {
        headers.insert(CORRELATION_HEADER, cid.as_str());
    }
    headers
}

fn from_nats(message: async_nats::Message) -> TransportMessage {
    let correlation_id = message
        .headers
        .as_ref()
        .and_then(|headers| headers.get(CORRELATION_HEADER))
        .map(|value| value.as_str().to_string());

    TransportMessage {
        data: message.payload,
        correlation_id,
        reply_to: message.reply.map(|subject| subject.to_string()),
        headers: Default::default(),
    }
}

#[async_trait]
impl Transport for NatsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Nats
    }

    fn host(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<ConnectionHandle> {
        let status = self.status.clone();
        let host = self.url.clone();

        let client = async_nats::ConnectOptions::new()
            .event_callback(move |event| {
                let status = status.clone();
                let host = host.clone();
                async move {
                    let raw = match event {
                        async_nats::Event::Connected => {
                            RawStatus::new(TransportKind::Nats, nats_status::CONNECTED, host)
                        }
                        async_nats::Event::Disconnected => {
                            RawStatus::new(TransportKind::Nats, nats_status::DISCONNECTED, host)
                        }
                        async_nats::Event::ServerError(err) => {
                            RawStatus::new(TransportKind::Nats, nats_status::ERROR, host)
                                .with_detail(err.to_string())
                        }
                        async_nats::Event::ClientError(err) => {
                            RawStatus::new(TransportKind::Nats, nats_status::ERROR, host)
                                .with_detail(err.to_string())
                        }
                        other => {
                            debug!(event = ?other, "nats event");
                            return;
                        }
                    };
                    let _ = status.send(raw);
                }
            })
            .connect(self.url.as_str())
            .await
            .map_err(|e| MessagingError::connection(&self.url, e))?;

        *self.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);
        self.emit(nats_status::CONNECTED);

        Ok(ConnectionHandle {
            kind: TransportKind::Nats,
            host: self.url.clone(),
        })
    }

    async fn disconnect(&self) -> Result<()> {
        let client = self.client.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(client) = client {
            if let Err(err) = client.flush().await {
                warn!(error = %err, "flush before disconnect failed");
            }
            drop(client);
            self.emit(nats_status::CLOSED);
        }
        Ok(())
    }

    async fn publish(&self, destination: &str, message: TransportMessage) -> Result<()> {
        let client = self
            .client()
            .ok_or_else(|| MessagingError::publish(destination, "not connected"))?;
        let headers = to_headers(&message);

        let published = match message.reply_to {
            Some(reply) => {
                client
                    .publish_with_reply_and_headers(
                        destination.to_string(),
                        reply,
                        headers,
                        message.data,
                    )
                    .await
            }
            None => {
                client
                    .publish_with_headers(destination.to_string(), headers, message.data)
                    .await
            }
        };
        published.map_err(|e| MessagingError::publish(destination, e))?;
        client
            .flush()
            .await
            .map_err(|e| MessagingError::publish(destination, e))
    }

    async fn consume(&self, destination: &str) -> Result<InboundStream> {
        let client = self
            .client()
            .ok_or_else(|| MessagingError::connection(&self.url, "not connected"))?;
        let subscriber = client
            .queue_subscribe(destination.to_string(), destination.to_string())
            .await
            .map_err(|e| MessagingError::connection(&self.url, e))?;

        let destination = destination.to_string();
        Ok(Box::pin(subscriber.map(move |message| {
            InboundMessage::new(destination.clone(), from_nats(message), Box::new(NoAck))
        })))
    }

    async fn reply_destination(&self) -> Result<String> {
        let client = self
            .client()
            .ok_or_else(|| MessagingError::connection(&self.url, "not connected"))?;
        Ok(client.new_inbox())
    }

    fn status_stream(&self) -> broadcast::Receiver<RawStatus> {
        self.status.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(headers: HeaderMap, reply: Option<&str>) -> async_nats::Message {
        async_nats::Message {
            subject: "orders".into(),
            reply: reply.map(Into::into),
            payload: "{}".into(),
            headers: Some(headers),
            status: None,
            description: None,
            length: 2,
        }
    }

    #[test]
    fn correlation_id_survives_the_header_round_trip() {
        let mut message = TransportMessage::new("{}");
        message.correlation_id = Some("c-42".to_string());
        message.reply_to = Some("_INBOX.abc".to_string());
        message
            .headers
            .insert("Trace-Id".to_string(), "t-1".to_string());

        let headers = to_headers(&message);
        assert_eq!(
            headers.get(CORRELATION_HEADER).map(|v| v.as_str()),
            Some("c-42")
        );
        assert_eq!(headers.get("Trace-Id").map(|v| v.as_str()), Some("t-1"));

        let decoded = from_nats(inbound(headers, message.reply_to.as_deref()));
        assert_eq!(decoded.correlation_id.as_deref(), Some("c-42"));
        assert_eq!(decoded.reply_to.as_deref(), Some("_INBOX.abc"));
        assert_eq!(decoded.data.as_ref(), b"{}");
    }

    #[test]
    fn message_without_correlation_header_has_none() {
        let message = TransportMessage::new("{}");
        let headers = to_headers(&message);
        assert!(headers.get(CORRELATION_HEADER).is_none());

        let decoded = from_nats(inbound(headers, None));
        assert_eq!(decoded.correlation_id, None);
        assert_eq!(decoded.reply_to, None);
    }
}
