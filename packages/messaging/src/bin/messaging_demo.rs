// Demo: a server and a client talking over an in-process broker

use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use messaging::{
    effect, ClientConfig, EffectRegistry, Event, MessagingClient, Microservice, PubSubBroker,
    PubSubTransport, QueueBroker, QueueTransport, ServerConfig, Transport,
};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn effects() -> EffectRegistry {
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
            effect::reply(|event: Event, ctx| async move {
                tracing::info!(channel = ctx.channel(), "handling EVENT_TEST");
                let n: i64 = event.payload_as()?;
                Ok(Event::new("EVENT_TEST_RESPONSE", json!(n + 1)))
            }),
        )
}

/// Two connections to the broker named by `MESSAGING_TRANSPORT`.
fn transports(host: &str) -> Result<(Box<dyn Transport>, Box<dyn Transport>)> {
    let kind = std::env::var("MESSAGING_TRANSPORT").unwrap_or_else(|_| "queue".to_string());
    match kind.as_str() {
        "queue" => {
            let broker = QueueBroker::new(host);
            Ok((
                Box::new(QueueTransport::new(&broker)),
                Box::new(QueueTransport::new(&broker)),
            ))
        }
        "pubsub" => {
            let broker = PubSubBroker::new(host);
            Ok((
                Box::new(PubSubTransport::new(&broker)),
                Box::new(PubSubTransport::new(&broker)),
            ))
        }
        #[cfg(feature = "amqp")]
        "amqp" => Ok((
            Box::new(messaging::AmqpTransport::new(host)),
            Box::new(messaging::AmqpTransport::new(host)),
        )),
        #[cfg(feature = "redis")]
        "redis" => Ok((
            Box::new(messaging::RedisTransport::new(host)),
            Box::new(messaging::RedisTransport::new(host)),
        )),
        #[cfg(feature = "nats")]
        "nats" => Ok((
            Box::new(messaging::NatsTransport::new(host)),
            Box::new(messaging::NatsTransport::new(host)),
        )),
        other => anyhow::bail!("unknown MESSAGING_TRANSPORT: {other}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,messaging=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if std::env::var("MESSAGING_QUEUE").is_err() {
        std::env::set_var("MESSAGING_QUEUE", "test_queue_server");
    }
    let server_config = ServerConfig::from_env()
        .context("Failed to load server configuration")?
        .with_event_destination("test_events");
    let client_config = ClientConfig::from_env().context("Failed to load client configuration")?;

    let (server_transport, client_transport) = transports(&server_config.host)?;
    let queue = server_config.queue.clone();

    let server = Microservice::new(server_transport, server_config)
        .with_effects(effects())
        .run()
        .await
        .context("Failed to start server")?;

    let client = MessagingClient::connect(client_transport, client_config)
        .await
        .context("Failed to connect client")?;
    let mut events = client
        .subscribe("test_events")
        .await
        .context("Failed to subscribe to events")?;

    let reply = client
        .send_message(&queue, Event::new("RPC_TEST", json!(1)))
        .await
        .context("RPC_TEST failed")?;
    tracing::info!(event_type = %reply.event_type, payload = %reply.payload, "reply received");

    client
        .emit_message(&queue, Event::new("EVENT_TEST", json!(1)))
        .await
        .context("EVENT_TEST failed")?;
    match tokio::time::timeout(Duration::from_secs(5), events.next()).await {
        Ok(Some(Ok(event))) => {
            tracing::info!(event_type = %event.event_type, payload = %event.payload, "event received")
        }
        Ok(Some(Err(err))) => tracing::warn!(error = %err, "undecodable event"),
        Ok(None) | Err(_) => tracing::warn!("no event received"),
    }

    client.close().await.context("Failed to close client")?;
    let report = server.close().await.context("Failed to close server")?;
    tracing::info!(completed = report.completed, aborted = report.aborted, "done");

    Ok(())
}
