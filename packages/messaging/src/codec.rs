//! Payload codecs.
//!
//! A [`Codec`] turns an [`Event`] body into bytes and back. Metadata is
//! moved between the event and the [`TransportMessage`] fields by the
//! provided `encode_message` / `decode_message` methods, so codecs only
//! deal with the body.

use bytes::Bytes;

use crate::error::{MessagingError, Result};
use crate::event::{CorrelationId, Event, EventMetadata};
use crate::message::TransportMessage;

/// Body serialization for events.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, event: &Event) -> Result<Bytes>;

    /// Decode a body. The returned event has empty metadata.
    fn decode(&self, data: &[u8]) -> Result<Event>;

    fn content_type(&self) -> &'static str;

    /// Encode an event into a transport message, carrying its metadata in
    /// the message fields.
    fn encode_message(&self, event: &Event) -> Result<TransportMessage> {
        Ok(TransportMessage {
            data: self.encode(event)?,
            correlation_id: event
                .metadata
                .correlation_id
                .as_ref()
                .map(|cid| cid.as_str().to_string()),
            reply_to: event.metadata.reply_to.clone(),
            headers: event.metadata.headers.clone(),
        })
    }

    /// Decode a transport message, restoring metadata from its fields.
    fn decode_message(&self, message: &TransportMessage) -> Result<Event> {
        let mut event = self.decode(&message.data)?;
        event.metadata = EventMetadata {
            correlation_id: message.correlation_id.clone().map(CorrelationId::from),
            reply_to: message.reply_to.clone(),
            headers: message.headers.clone(),
        };
        Ok(event)
    }
}

/// JSON body: `{"type": "...", "payload": ...}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, event: &Event) -> Result<Bytes> {
        serde_json::to_vec(event)
            .map(Bytes::from)
            .map_err(|e| MessagingError::Decode(format!("failed to encode '{}': {e}", event.event_type)))
    }

    fn decode(&self, data: &[u8]) -> Result<Event> {
        let event: Event = serde_json::from_slice(data)
            .map_err(|e| MessagingError::Decode(e.to_string()))?;
        if event.event_type.is_empty() {
            return Err(MessagingError::Decode("event type is empty".into()));
        }
        Ok(event)
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_travels_in_message_fields() {
        let event = Event::new("RPC_TEST", json!(1))
            .with_correlation(CorrelationId::from("cid-1"))
            .with_reply_to("amq.gen-1")
            .with_header("tenant", "a");

        let message = JsonCodec.encode_message(&event).unwrap();
        assert_eq!(message.correlation_id.as_deref(), Some("cid-1"));
        assert_eq!(message.reply_to.as_deref(), Some("amq.gen-1"));

        let decoded = JsonCodec.decode_message(&message).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn rejects_non_json_bodies() {
        let err = JsonCodec.decode(b"not json").unwrap_err();
        assert!(matches!(err, MessagingError::Decode(_)));
    }

    #[test]
    fn rejects_bodies_without_a_type() {
        assert!(JsonCodec.decode(br#"{"payload": 1}"#).is_err());
        assert!(JsonCodec.decode(br#"{"type": "", "payload": 1}"#).is_err());
    }

    #[test]
    fn missing_payload_decodes_as_null() {
        let event = JsonCodec.decode(br#"{"type": "PING"}"#).unwrap();
        assert_eq!(event.event_type, "PING");
        assert!(event.payload.is_null());
    }
}
