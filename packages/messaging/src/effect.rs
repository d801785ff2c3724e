//! Effects: handlers for inbound events.
//!
//! An [`Effect`] receives one inbound [`Event`] and produces a stream of
//! output events. For a request, each output is a reply; otherwise each
//! output is emitted as a new event. Most effects produce exactly one
//! output, so [`reply`] and [`outputs`] wrap plain async functions.
//!
//! Effects are registered by event type in an [`EffectRegistry`], optionally
//! behind a [`PayloadValidator`]. Several effects may share a type; each runs.
//!
//! # Example
//!
//! ```ignore
//! use messaging::{effect, Event, EffectRegistry};
//! use serde_json::json;
//!
//! let effects = EffectRegistry::new().on_validated(
//!     "RPC_TEST",
//!     effect::validate_as::<i64>(),
//!     effect::reply(|event: Event, _ctx| async move {
//!         let n: i64 = event.payload_as()?;
//!         Ok(Event::new("RPC_TEST_RESULT", json!(n + 1)))
//!     }),
//! );
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::ServerConfig;
use crate::event::{CorrelationId, Event};
use crate::transport::TransportKind;

/// Output stream of an effect. Errors fail the inbound message.
pub type EventStream = BoxStream<'static, anyhow::Result<Event>>;

// =============================================================================
// Effect Trait
// =============================================================================

/// A handler for one event type.
pub trait Effect: Send + Sync + 'static {
    fn call(&self, event: Event, ctx: EffectContext) -> EventStream;
}

impl<F, S> Effect for F
where
    F: Fn(Event, EffectContext) -> S + Send + Sync + 'static,
    S: Stream<Item = anyhow::Result<Event>> + Send + 'static,
{
    fn call(&self, event: Event, ctx: EffectContext) -> EventStream {
        Box::pin(self(event, ctx))
    }
}

/// Effect producing exactly one output.
pub fn reply<F, Fut>(handler: F) -> impl Effect
where
    F: Fn(Event, EffectContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Event>> + Send + 'static,
{
    move |event: Event, ctx: EffectContext| stream::once(handler(event, ctx))
}

/// Effect producing any number of outputs at once.
pub fn outputs<F, Fut>(handler: F) -> impl Effect
where
    F: Fn(Event, EffectContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<Event>>> + Send + 'static,
{
    move |event: Event, ctx: EffectContext| {
        stream::once(handler(event, ctx)).flat_map(|result| {
            let items: Vec<anyhow::Result<Event>> = match result {
                Ok(events) => events.into_iter().map(Ok).collect(),
                Err(err) => vec![Err(err)],
            };
            stream::iter(items)
        })
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Pluggable payload check run before an effect. `Err` rejects the message.
pub trait PayloadValidator: Send + Sync + 'static {
    fn validate(&self, payload: &Value) -> Result<(), String>;
}

impl<F> PayloadValidator for F
where
    F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
{
    fn validate(&self, payload: &Value) -> Result<(), String> {
        self(payload)
    }
}

/// Validator accepting payloads that deserialize into `T`.
pub fn validate_as<T: DeserializeOwned + 'static>() -> impl PayloadValidator {
    DeserializesAs::<T>(PhantomData)
}

struct DeserializesAs<T>(PhantomData<fn() -> T>);

impl<T: DeserializeOwned + 'static> PayloadValidator for DeserializesAs<T> {
    fn validate(&self, payload: &Value) -> Result<(), String> {
        T::deserialize(payload)
            .map(|_| ())
            .map_err(|e| format!("expected {}: {e}", std::any::type_name::<T>()))
    }
}

// =============================================================================
// Context
// =============================================================================

/// Per-message context handed to effects.
#[derive(Clone)]
pub struct EffectContext {
    transport: TransportKind,
    host: Arc<str>,
    channel: Arc<str>,
    config: Arc<ServerConfig>,
    correlation_id: Option<CorrelationId>,
    span: tracing::Span,
}

impl EffectContext {
    pub(crate) fn new(
        transport: TransportKind,
        host: Arc<str>,
        config: Arc<ServerConfig>,
        correlation_id: Option<CorrelationId>,
        span: tracing::Span,
    ) -> Self {
        Self {
            transport,
            host,
            channel: Arc::from(config.queue.as_str()),
            config,
            correlation_id,
            span,
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Destination the message was consumed from.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    /// Span of the message being handled.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

impl std::fmt::Debug for EffectContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectContext")
            .field("transport", &self.transport)
            .field("channel", &self.channel)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// One registered effect.
pub(crate) struct Registration {
    pub(crate) validator: Option<Arc<dyn PayloadValidator>>,
    pub(crate) effect: Arc<dyn Effect>,
}

/// Effects keyed by event type. Built once, read-only afterwards.
#[derive(Clone, Default)]
pub struct EffectRegistry {
    effects: HashMap<String, Vec<Arc<Registration>>>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an effect for an event type.
    pub fn on(self, event_type: impl Into<String>, effect: impl Effect) -> Self {
        self.register(event_type.into(), None, Arc::new(effect))
    }

    /// Register an effect that only runs when the payload passes `validator`.
    pub fn on_validated(
        self,
        event_type: impl Into<String>,
        validator: impl PayloadValidator,
        effect: impl Effect,
    ) -> Self {
        self.register(event_type.into(), Some(Arc::new(validator)), Arc::new(effect))
    }

    fn register(
        mut self,
        event_type: String,
        validator: Option<Arc<dyn PayloadValidator>>,
        effect: Arc<dyn Effect>,
    ) -> Self {
        self.effects
            .entry(event_type)
            .or_default()
            .push(Arc::new(Registration { validator, effect }));
        self
    }

    pub(crate) fn matching(&self, event_type: &str) -> &[Arc<Registration>] {
        self.effects
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.effects.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Number of registered effects.
    pub fn len(&self) -> usize {
        self.effects.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}

impl std::fmt::Debug for EffectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn context() -> EffectContext {
        EffectContext::new(
            TransportKind::Queue,
            Arc::from("amqp://localhost:5672"),
            Arc::new(ServerConfig::new("amqp://localhost:5672", "test_queue_server")),
            None,
            tracing::Span::none(),
        )
    }

    #[tokio::test]
    async fn reply_effect_yields_one_output() {
        let effect = reply(|event: Event, _ctx| async move {
            let n: i64 = event.payload_as()?;
            Ok(Event::new("RPC_TEST_RESULT", json!(n + 1)))
        });

        let produced: Vec<_> = effect
            .call(Event::new("RPC_TEST", json!(1)), context())
            .collect()
            .await;
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].as_ref().unwrap().payload, json!(2));
    }

    #[tokio::test]
    async fn outputs_effect_flattens_and_propagates_errors() {
        let many = outputs(|_event: Event, _ctx| async move {
            Ok(vec![Event::named("A"), Event::named("B")])
        });
        let failing = outputs(|_event: Event, _ctx| async move {
            Err::<Vec<Event>, _>(anyhow::anyhow!("boom"))
        });

        let produced: Vec<_> = many.call(Event::named("X"), context()).collect().await;
        assert_eq!(produced.len(), 2);

        let failed: Vec<_> = failing.call(Event::named("X"), context()).collect().await;
        assert_eq!(failed.len(), 1);
        assert!(failed[0].is_err());
    }

    #[test]
    fn registry_groups_effects_by_type() {
        let registry = EffectRegistry::new()
            .on("RPC_TEST", reply(|e: Event, _ctx| async move { Ok(e) }))
            .on("RPC_TEST", reply(|e: Event, _ctx| async move { Ok(e) }))
            .on("EVENT_TEST", reply(|e: Event, _ctx| async move { Ok(e) }));

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.matching("RPC_TEST").len(), 2);
        assert!(registry.matching("UNKNOWN").is_empty());
        assert_eq!(registry.event_types(), vec!["EVENT_TEST", "RPC_TEST"]);
    }

    #[test]
    fn typed_validator_checks_payload_shape() {
        let validator = validate_as::<i64>();
        assert!(validator.validate(&json!(1)).is_ok());
        assert!(validator.validate(&json!("one")).is_err());

        let positive = |payload: &Value| match payload.as_i64() {
            Some(n) if n > 0 => Ok(()),
            _ => Err("must be positive".to_string()),
        };
        assert!(positive.validate(&json!(-1)).is_err());
    }
}
