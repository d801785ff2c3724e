//! Message listener: runs the effect pipeline for one inbound message.
//!
//! ```text
//! InboundMessage
//!     │ decode ──────── fails ──► nack, DecodeError
//!     ▼
//! Event ── no effect for type ──► ack, dropped
//!     │
//!     ▼ for each registered effect
//! validate ─► effect.call() ─► outputs
//!                                 │
//!        reply_to set ────────────┼──► publish to reply_to (correlation echoed)
//!        otherwise ───────────────┴──► publish to event destination, or drop
//!     │
//!     ▼
//! ack if every effect succeeded, nack otherwise (exactly once)
//! ```
//!
//! Handler failures, rejections and panics are contained to the message
//! they occurred on: they become a nack plus an error on the status stream,
//! and the listener keeps going.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, error, info_span, trace, warn, Instrument};

use crate::codec::{Codec, JsonCodec};
use crate::config::ServerConfig;
use crate::effect::{EffectContext, EffectRegistry, Registration};
use crate::error::{MessagingError, Result};
use crate::event::{CorrelationId, Event};
use crate::message::{Delivery, InboundMessage};
use crate::status::StatusEvent;
use crate::transport::Transport;

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerOutcome {
    /// Every matching effect succeeded; the message was acked.
    Handled { outputs: usize },
    /// No effect registered for the type; acked and dropped.
    Unmatched,
    /// The body could not be decoded; nacked.
    DecodeFailed,
    /// At least one effect failed; nacked.
    Failed,
}

#[derive(Default)]
struct Counters {
    handled: AtomicU64,
    failed: AtomicU64,
    unmatched: AtomicU64,
    decode_failed: AtomicU64,
}

/// Snapshot of listener counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub handled: u64,
    pub failed: u64,
    pub unmatched: u64,
    pub decode_failed: u64,
}

/// Where an effect's outputs go.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Reply {
        destination: String,
        correlation_id: Option<CorrelationId>,
    },
    Emit {
        destination: Option<String>,
    },
}

impl Route {
    fn for_event(event: &Event, config: &ServerConfig) -> Self {
        match &event.metadata.reply_to {
            Some(destination) => Route::Reply {
                destination: destination.clone(),
                correlation_id: event.metadata.correlation_id.clone(),
            },
            None => Route::Emit {
                destination: config.event_destination.clone(),
            },
        }
    }
}

/// Shared state the listener needs to process messages.
pub(crate) struct ListenerContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) host: Arc<str>,
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) events: broadcast::Sender<StatusEvent>,
}

/// Decodes, dispatches and settles inbound messages.
pub struct MessageListener {
    effects: EffectRegistry,
    codec: Arc<dyn Codec>,
    counters: Counters,
}

impl MessageListener {
    pub fn new(effects: EffectRegistry) -> Self {
        Self {
            effects,
            codec: Arc::new(JsonCodec),
            counters: Counters::default(),
        }
    }

    pub fn with_effects(mut self, effects: EffectRegistry) -> Self {
        self.effects = effects;
        self
    }

    pub fn with_codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn effects(&self) -> &EffectRegistry {
        &self.effects
    }

    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            handled: self.counters.handled.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            decode_failed: self.counters.decode_failed.load(Ordering::Relaxed),
        }
    }

    pub(crate) async fn process(&self, inbound: InboundMessage, ctx: &ListenerContext) -> ListenerOutcome {
        let redelivered = inbound.is_redelivered();
        let (message, delivery) = inbound.into_parts();

        let event = match self.codec.decode_message(&message) {
            Ok(event) => event,
            Err(err) => {
                warn!(destination = delivery.destination(), error = %err, "dropping undecodable message");
                self.counters.decode_failed.fetch_add(1, Ordering::Relaxed);
                report(ctx, &err);
                settle(delivery, false, false).await;
                return ListenerOutcome::DecodeFailed;
            }
        };

        let registrations = self.effects.matching(&event.event_type);
        if registrations.is_empty() {
            debug!(event_type = %event.event_type, "no effect registered, message dropped");
            self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
            settle(delivery, true, false).await;
            return ListenerOutcome::Unmatched;
        }

        let span = info_span!(
            "message",
            event_type = %event.event_type,
            cid = event.metadata.correlation_id.as_ref().map(|c| c.as_str()).unwrap_or(""),
            redelivered,
        );
        let route = Route::for_event(&event, &ctx.config);

        let mut outputs = 0;
        let mut failed = false;
        for registration in registrations {
            let effect_ctx = EffectContext::new(
                ctx.transport.kind(),
                ctx.host.clone(),
                ctx.config.clone(),
                event.metadata.correlation_id.clone(),
                span.clone(),
            );
            let run = self
                .run_effect(registration, event.clone(), effect_ctx, &route, ctx)
                .instrument(span.clone());
            let result = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(result) => result,
                Err(panic_info) => {
                    let panic_msg = extract_panic_message(&panic_info);
                    error!(event_type = %event.event_type, panic = %panic_msg, "effect panicked");
                    Err(MessagingError::handler(
                        &event.event_type,
                        format!("effect panicked: {panic_msg}"),
                    ))
                }
            };

            match result {
                Ok(published) => outputs += published,
                Err(err) => {
                    error!(parent: &span, error = %err, "effect failed");
                    report(ctx, &err);
                    failed = true;
                }
            }
        }

        if failed {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            settle(delivery, false, ctx.config.requeue_on_error).await;
            ListenerOutcome::Failed
        } else {
            self.counters.handled.fetch_add(1, Ordering::Relaxed);
            settle(delivery, true, false).await;
            ListenerOutcome::Handled { outputs }
        }
    }

    async fn run_effect(
        &self,
        registration: &Registration,
        event: Event,
        effect_ctx: EffectContext,
        route: &Route,
        ctx: &ListenerContext,
    ) -> Result<usize> {
        let event_type = event.event_type.clone();

        if let Some(validator) = &registration.validator {
            validator
                .validate(&event.payload)
                .map_err(|reason| MessagingError::handler(&event_type, format!("payload rejected: {reason}")))?;
        }

        let mut produced = registration.effect.call(event, effect_ctx);
        let mut published = 0;
        while let Some(output) = produced.next().await {
            let output = output.map_err(|e| MessagingError::handler(&event_type, format!("{e:#}")))?;
            if self.publish_output(output, route, ctx).await? {
                published += 1;
            }
        }
        Ok(published)
    }

    /// Publish one output. Returns `false` when it was dropped for lack of
    /// a destination.
    async fn publish_output(&self, mut output: Event, route: &Route, ctx: &ListenerContext) -> Result<bool> {
        let destination = match route {
            Route::Reply {
                destination,
                correlation_id,
            } => {
                output.metadata.correlation_id = correlation_id.clone();
                output.metadata.reply_to = None;
                destination
            }
            Route::Emit {
                destination: Some(destination),
            } => destination,
            Route::Emit { destination: None } => {
                debug!(event_type = %output.event_type, "no event destination configured, output dropped");
                return Ok(false);
            }
        };

        let message = self.codec.encode_message(&output)?;
        ctx.transport.publish(destination, message).await?;
        trace!(destination = %destination, event_type = %output.event_type, "output published");
        Ok(true)
    }
}

impl std::fmt::Debug for MessageListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageListener")
            .field("effects", &self.effects)
            .field("content_type", &self.codec.content_type())
            .finish_non_exhaustive()
    }
}

fn report(ctx: &ListenerContext, err: &MessagingError) {
    let _ = ctx.events.send(StatusEvent::error(err, &ctx.config.queue));
}

async fn settle(delivery: Delivery, ack: bool, requeue: bool) {
    let destination = delivery.destination().to_string();
    let settled = if ack {
        delivery.ack().await
    } else {
        delivery.nack(requeue).await
    };
    if let Err(err) = settled {
        warn!(destination = %destination, ack, error = %err, "failed to settle message");
    }
}

fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::{reply, validate_as};
    use crate::transport::{QueueBroker, QueueTransport};
    use serde_json::json;

    struct Harness {
        broker: QueueBroker,
        ctx: ListenerContext,
        status: broadcast::Receiver<StatusEvent>,
    }

    async fn harness(config: ServerConfig) -> Harness {
        let broker = QueueBroker::new("amqp://localhost:5672");
        let transport = QueueTransport::new(&broker);
        transport.connect().await.unwrap();
        let (events, status) = broadcast::channel(16);
        Harness {
            broker,
            ctx: ListenerContext {
                transport: Arc::new(transport),
                host: Arc::from("amqp://localhost:5672"),
                config: Arc::new(config),
                events,
            },
            status,
        }
    }

    async fn deliver(h: &Harness, event: &Event) -> InboundMessage {
        let message = JsonCodec.encode_message(event).unwrap();
        h.ctx.transport.publish("inbox", message).await.unwrap();
        let mut stream = h.ctx.transport.consume("inbox").await.unwrap();
        stream.next().await.unwrap()
    }

    async fn next_on(h: &Harness, destination: &str) -> Event {
        let mut stream = h.ctx.transport.consume(destination).await.unwrap();
        let inbound = stream.next().await.unwrap();
        JsonCodec.decode_message(inbound.message()).unwrap()
    }

    fn increment() -> EffectRegistry {
        EffectRegistry::new().on_validated(
            "RPC_TEST",
            validate_as::<i64>(),
            reply(|event: Event, _ctx| async move {
                let n: i64 = event.payload_as()?;
                Ok(Event::new("RPC_TEST_RESULT", json!(n + 1)))
            }),
        )
    }

    #[tokio::test]
    async fn request_reply_goes_to_reply_to_with_correlation() {
        let h = harness(ServerConfig::new("amqp://localhost:5672", "inbox")).await;
        let listener = MessageListener::new(increment());
        let request = Event::new("RPC_TEST", json!(1))
            .with_correlation(CorrelationId::from("cid-7"))
            .with_reply_to("replies");

        let outcome = listener.process(deliver(&h, &request).await, &h.ctx).await;
        assert_eq!(outcome, ListenerOutcome::Handled { outputs: 1 });

        let reply = next_on(&h, "replies").await;
        assert_eq!(reply.event_type, "RPC_TEST_RESULT");
        assert_eq!(reply.payload, json!(2));
        assert_eq!(reply.correlation_id(), Some(&CorrelationId::from("cid-7")));
        assert_eq!(h.broker.queue_depth("inbox"), 0);
    }

    #[tokio::test]
    async fn fire_and_forget_outputs_go_to_event_destination() {
        let config = ServerConfig::new("amqp://localhost:5672", "inbox").with_event_destination("events");
        let h = harness(config).await;
        let listener = MessageListener::new(EffectRegistry::new().on(
            "EVENT_TEST",
            reply(|event: Event, _ctx| async move {
                let n: i64 = event.payload_as()?;
                Ok(Event::new("EVENT_TEST_RESPONSE", json!(n + 1)))
            }),
        ));

        let outcome = listener
            .process(deliver(&h, &Event::new("EVENT_TEST", json!(1))).await, &h.ctx)
            .await;
        assert_eq!(outcome, ListenerOutcome::Handled { outputs: 1 });

        let emitted = next_on(&h, "events").await;
        assert_eq!(emitted.event_type, "EVENT_TEST_RESPONSE");
        assert!(emitted.correlation_id().is_none());
    }

    #[tokio::test]
    async fn outputs_without_destination_are_dropped() {
        let h = harness(ServerConfig::new("amqp://localhost:5672", "inbox")).await;
        let listener = MessageListener::new(increment());

        let outcome = listener
            .process(deliver(&h, &Event::new("RPC_TEST", json!(1))).await, &h.ctx)
            .await;
        assert_eq!(outcome, ListenerOutcome::Handled { outputs: 0 });
    }

    #[tokio::test]
    async fn unmatched_messages_are_acked_and_dropped() {
        let h = harness(ServerConfig::new("amqp://localhost:5672", "inbox")).await;
        let listener = MessageListener::new(increment());

        let outcome = listener
            .process(deliver(&h, &Event::named("SOMETHING_ELSE")).await, &h.ctx)
            .await;
        assert_eq!(outcome, ListenerOutcome::Unmatched);
        assert_eq!(h.broker.queue_depth("inbox"), 0);
        assert_eq!(listener.stats().unmatched, 1);
    }

    #[tokio::test]
    async fn undecodable_messages_are_nacked_and_reported() {
        let mut h = harness(ServerConfig::new("amqp://localhost:5672", "inbox")).await;
        let listener = MessageListener::new(increment());
        h.ctx
            .transport
            .publish("inbox", crate::message::TransportMessage::new(&b"garbage"[..]))
            .await
            .unwrap();
        let inbound = h.ctx.transport.consume("inbox").await.unwrap().next().await.unwrap();

        assert_eq!(listener.process(inbound, &h.ctx).await, ListenerOutcome::DecodeFailed);
        assert_eq!(h.broker.queue_depth("inbox"), 0);
        assert_eq!(h.status.recv().await.unwrap().phase(), crate::status::StatusPhase::Error);
    }

    #[tokio::test]
    async fn rejected_payloads_fail_without_requeue() {
        let mut h = harness(ServerConfig::new("amqp://localhost:5672", "inbox")).await;
        let listener = MessageListener::new(increment());

        let outcome = listener
            .process(deliver(&h, &Event::new("RPC_TEST", json!("one"))).await, &h.ctx)
            .await;
        assert_eq!(outcome, ListenerOutcome::Failed);
        assert_eq!(h.broker.queue_depth("inbox"), 0);

        match h.status.recv().await.unwrap() {
            StatusEvent::Error { error, channel } => {
                assert_eq!(error.name, "HandlerError");
                assert!(error.message.contains("payload rejected"));
                assert_eq!(channel, "inbox");
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn failures_can_requeue_when_configured() {
        let config = ServerConfig::new("amqp://localhost:5672", "inbox").with_requeue_on_error(true);
        let h = harness(config).await;
        let listener = MessageListener::new(EffectRegistry::new().on(
            "FLAKY",
            reply(|_event: Event, _ctx| async move { Err(anyhow::anyhow!("downstream unavailable")) }),
        ));

        let outcome = listener.process(deliver(&h, &Event::named("FLAKY")).await, &h.ctx).await;
        assert_eq!(outcome, ListenerOutcome::Failed);
        assert_eq!(h.broker.queue_depth("inbox"), 1);
    }

    #[tokio::test]
    async fn panicking_effect_is_contained() {
        let h = harness(ServerConfig::new("amqp://localhost:5672", "inbox")).await;
        let listener = MessageListener::new(
            EffectRegistry::new()
                .on(
                    "BOOM",
                    reply(|_event: Event, _ctx| async move {
                        if true {
                            panic!("handler exploded");
                        }
                        Ok(Event::named("NEVER"))
                    }),
                )
                .on("OK", reply(|_event: Event, _ctx| async move { Ok(Event::named("DONE")) })),
        );

        let boom = listener.process(deliver(&h, &Event::named("BOOM")).await, &h.ctx).await;
        let ok = listener.process(deliver(&h, &Event::named("OK")).await, &h.ctx).await;

        assert_eq!(boom, ListenerOutcome::Failed);
        assert_eq!(ok, ListenerOutcome::Handled { outputs: 0 });
        assert_eq!(listener.stats().failed, 1);
        assert_eq!(listener.stats().handled, 1);
    }

    #[tokio::test]
    async fn every_matching_effect_runs() {
        let config = ServerConfig::new("amqp://localhost:5672", "inbox").with_event_destination("events");
        let h = harness(config).await;
        let listener = MessageListener::new(
            EffectRegistry::new()
                .on("FANOUT", reply(|_e: Event, _ctx| async move { Ok(Event::named("FIRST")) }))
                .on("FANOUT", reply(|_e: Event, _ctx| async move { Ok(Event::named("SECOND")) })),
        );

        let outcome = listener.process(deliver(&h, &Event::named("FANOUT")).await, &h.ctx).await;
        assert_eq!(outcome, ListenerOutcome::Handled { outputs: 2 });
        assert_eq!(h.broker.queue_depth("events"), 2);
    }
}
