// Common test utilities

#![allow(dead_code)]

use std::time::Duration;

use messaging::{
    effect, ClientConfig, EffectRegistry, Event, ReconnectPolicy, ServerConfig, StatusEvent,
    StatusPhase,
};
use serde_json::json;
use tokio::sync::broadcast;

pub const QUEUE_HOST: &str = "amqp://localhost:5672";
pub const PUBSUB_HOST: &str = "redis://localhost:6379";
pub const SERVER_QUEUE: &str = "test_queue_server";
pub const EVENTS: &str = "test_events";

/// How long a test waits for any single status event.
pub const STATUS_WAIT: Duration = Duration::from_secs(5);

/// Initialize tracing once. Respects RUST_LOG.
pub fn init_tracing() {
    // try_init() so repeated calls across tests do not panic
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(5),
        multiplier: 2.0,
        max_delay: Duration::from_millis(50),
    }
}

pub fn server_config(host: &str) -> ServerConfig {
    ServerConfig::new(host, SERVER_QUEUE)
        .with_reconnect(fast_reconnect())
        .with_shutdown_grace(Duration::from_secs(2))
}

pub fn client_config(host: &str) -> ClientConfig {
    ClientConfig::new(host)
        .with_reconnect(fast_reconnect())
        .with_reply_timeout(Duration::from_secs(5))
        .with_sweep_interval(Duration::from_millis(50))
}

/// RPC_TEST replies with payload + 1; EVENT_TEST answers with
/// EVENT_TEST_RESPONSE carrying payload + 1.
pub fn test_effects() -> EffectRegistry {
    EffectRegistry::new()
        .on_validated(
            "RPC_TEST",
            effect::validate_as::<i64>(),
            effect::reply(|event: Event, _ctx| async move {
                let n: i64 = event.payload_as()?;
                Ok(Event::new("RPC_TEST_RESULT", json!(n + 1)))
            }),
        )
        .on(
            "EVENT_TEST",
            effect::reply(|event: Event, _ctx| async move {
                let n: i64 = event.payload_as()?;
                Ok(Event::new("EVENT_TEST_RESPONSE", json!(n + 1)))
            }),
        )
}

/// Next status event, errors included.
pub async fn next_event(rx: &mut broadcast::Receiver<StatusEvent>) -> StatusEvent {
    tokio::time::timeout(STATUS_WAIT, rx.recv())
        .await
        .expect("timed out waiting for status event")
        .expect("status stream closed")
}

/// Next connect/disconnect phase, skipping error events.
pub async fn next_phase(rx: &mut broadcast::Receiver<StatusEvent>) -> StatusPhase {
    loop {
        let event = next_event(rx).await;
        if !matches!(event, StatusEvent::Error { .. }) {
            return event.phase();
        }
    }
}

/// Next error event as `(name, message)`.
pub async fn next_error(rx: &mut broadcast::Receiver<StatusEvent>) -> (String, String) {
    loop {
        if let StatusEvent::Error { error, .. } = next_event(rx).await {
            return (error.name, error.message);
        }
    }
}

/// Phases received within `window`, skipping error events.
pub async fn phases_within(
    rx: &mut broadcast::Receiver<StatusEvent>,
    window: Duration,
) -> Vec<StatusPhase> {
    let mut phases = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        if !matches!(event, StatusEvent::Error { .. }) {
            phases.push(event.phase());
        }
    }
    phases
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
