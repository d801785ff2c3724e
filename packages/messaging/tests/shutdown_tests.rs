//! Integration tests for bounded concurrency and shutdown.
//!
//! - At most `max_in_flight` handlers run at once
//! - `close()` drains handlers within the grace period and cancels the rest
//! - A transport that will not close surfaces a ShutdownError

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crate::common::*;
use messaging::{
    effect, ConnectionHandle, DrainReport, EffectRegistry, Event, InboundStream, MessagingClient,
    MessagingError, Microservice, QueueBroker, QueueTransport, RawStatus, Transport,
    TransportKind, TransportMessage,
};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

// =============================================================================
// Test Helpers
// =============================================================================

/// EVENT_TEST effect that reports when it starts, then sleeps.
fn slow_effects(delay: Duration) -> (EffectRegistry, mpsc::UnboundedReceiver<()>) {
    let (started_tx, started) = mpsc::unbounded_channel();
    let effects = EffectRegistry::new().on(
        "EVENT_TEST",
        effect::reply(move |event: Event, _ctx| {
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                tokio::time::sleep(delay).await;
                Ok(Event::new("EVENT_TEST_RESPONSE", event.payload))
            }
        }),
    );
    (effects, started)
}

/// Queue transport whose disconnect never completes.
struct StuckDisconnect(QueueTransport);

#[async_trait]
impl Transport for StuckDisconnect {
    fn kind(&self) -> TransportKind {
        self.0.kind()
    }

    fn host(&self) -> &str {
        self.0.host()
    }

    async fn connect(&self) -> messaging::Result<ConnectionHandle> {
        self.0.connect().await
    }

    async fn disconnect(&self) -> messaging::Result<()> {
        std::future::pending::<messaging::Result<()>>().await
    }

    async fn publish(&self, destination: &str, message: TransportMessage) -> messaging::Result<()> {
        self.0.publish(destination, message).await
    }

    async fn consume(&self, destination: &str) -> messaging::Result<InboundStream> {
        self.0.consume(destination).await
    }

    async fn reply_destination(&self) -> messaging::Result<String> {
        self.0.reply_destination().await
    }

    fn status_stream(&self) -> broadcast::Receiver<RawStatus> {
        self.0.status_stream()
    }
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn in_flight_handlers_are_bounded() {
    init_tracing();
    let broker = QueueBroker::new(QUEUE_HOST);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let effects = {
        let running = running.clone();
        let peak = peak.clone();
        EffectRegistry::new().on(
            "EVENT_TEST",
            effect::outputs(move |_event: Event, _ctx| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(Vec::new())
                }
            }),
        )
    };
    let server = Microservice::new(
        QueueTransport::new(&broker),
        server_config(QUEUE_HOST).with_max_in_flight(2),
    )
    .with_effects(effects)
    .run()
    .await
    .unwrap();
    let client = MessagingClient::connect(QueueTransport::new(&broker), client_config(QUEUE_HOST))
        .await
        .unwrap();

    for n in 0..6 {
        client
            .emit_message(SERVER_QUEUE, Event::new("EVENT_TEST", json!(n)))
            .await
            .unwrap();
    }

    assert!(eventually(Duration::from_secs(5), || server.stats().handled == 6).await);
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn close_drains_handlers_within_grace() {
    init_tracing();
    let broker = QueueBroker::new(QUEUE_HOST);
    let (effects, mut started) = slow_effects(Duration::from_millis(100));
    let server = Microservice::new(QueueTransport::new(&broker), server_config(QUEUE_HOST))
        .with_effects(effects)
        .run()
        .await
        .unwrap();
    let client = MessagingClient::connect(QueueTransport::new(&broker), client_config(QUEUE_HOST))
        .await
        .unwrap();

    for n in 0..3 {
        client
            .emit_message(SERVER_QUEUE, Event::new("EVENT_TEST", json!(n)))
            .await
            .unwrap();
    }
    for _ in 0..3 {
        started.recv().await.unwrap();
    }

    let report = server.close().await.unwrap();
    assert_eq!(
        report,
        DrainReport {
            completed: 3,
            aborted: 0
        }
    );
    assert_eq!(broker.queue_depth(SERVER_QUEUE), 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn close_cancels_handlers_after_grace_and_requeues_their_messages() {
    init_tracing();
    let broker = QueueBroker::new(QUEUE_HOST);
    let (effects, mut started) = slow_effects(Duration::from_secs(30));
    let server = Microservice::new(
        QueueTransport::new(&broker),
        server_config(QUEUE_HOST).with_shutdown_grace(Duration::from_millis(50)),
    )
    .with_effects(effects)
    .run()
    .await
    .unwrap();
    let client = MessagingClient::connect(QueueTransport::new(&broker), client_config(QUEUE_HOST))
        .await
        .unwrap();

    client
        .emit_message(SERVER_QUEUE, Event::new("EVENT_TEST", json!(1)))
        .await
        .unwrap();
    started.recv().await.unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), server.close())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        report,
        DrainReport {
            completed: 0,
            aborted: 1
        }
    );
    // The unsettled delivery goes back to the queue
    assert_eq!(broker.queue_depth(SERVER_QUEUE), 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn close_with_stuck_transport_fails_with_shutdown_error() {
    init_tracing();
    let broker = QueueBroker::new(QUEUE_HOST);
    let server = Microservice::new(
        StuckDisconnect(QueueTransport::new(&broker)),
        server_config(QUEUE_HOST).with_disconnect_timeout(Duration::from_millis(50)),
    )
    .with_effects(test_effects())
    .run()
    .await
    .unwrap();

    let err = server.close().await.unwrap_err();
    assert!(matches!(err, MessagingError::Shutdown { .. }));
    assert_eq!(err.name(), "ShutdownError");
}

#[tokio::test]
async fn close_is_clean_when_idle() {
    init_tracing();
    let broker = QueueBroker::new(QUEUE_HOST);
    let server = Microservice::new(QueueTransport::new(&broker), server_config(QUEUE_HOST))
        .with_effects(test_effects())
        .run()
        .await
        .unwrap();
    let client = MessagingClient::connect(QueueTransport::new(&broker), client_config(QUEUE_HOST))
        .await
        .unwrap();
    assert_eq!(broker.live_connections(), 2);
    let reply_to = client.reply_destination().to_string();
    assert!(broker.has_queue(&reply_to));

    client.close().await.unwrap();
    assert!(!broker.has_queue(&reply_to));
    assert_eq!(server.close().await.unwrap(), DrainReport::default());
    assert_eq!(broker.live_connections(), 0);
}
