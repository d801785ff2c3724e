//! # Messaging
//!
//! A broker-agnostic messaging runtime for services: declare effects for
//! inbound events, emit events, and make correlated request/reply calls over
//! interchangeable transports.
//!
//! ## Core Concepts
//!
//! - [`Event`] = a type tag, a JSON payload and routing metadata
//! - [`Effect`] = a handler turning one inbound event into output events
//! - [`Transport`] = one connection to a broker (queue, pub/sub, NATS)
//!
//! ## Architecture
//!
//! ```text
//!  MessagingClient                              Microservice
//!     │ send_message()                              │ run()
//!     │   register cid ─► CorrelationRegistry       ▼
//!     │   publish ─────────► Transport ─────► consume loop (max_in_flight)
//!     │                                            │
//!     │                                            ▼
//!     │                                   MessageListener.process()
//!     │                                     decode ─► effects ─► outputs
//!     │                                            │
//!     │   resolve cid ◄──── reply_to ◄──────────────┤ reply (cid echoed)
//!     ▼                                            └─► event destination
//!  Ok(reply) / Timeout
//!
//!  Transport status ─► ConnectionMonitor ─► StatusEvent stream (connect/disconnect/error)
//!                         └─► reconnect with backoff on loss
//! ```
//!
//! ## Guarantees
//!
//! - **At most once per settlement**: every inbound message is acked or
//!   nacked exactly once; failed handlers are not retried unless
//!   `requeue_on_error` is set
//! - **No cross-resolution**: a reply only resolves the request carrying the
//!   same correlation id, and only once
//! - **Bounded**: at most `max_in_flight` handlers run per server
//! - **Recovering**: lost connections are re-established forever with
//!   exponential backoff; consumers resubscribe
//!
//! ## Example
//!
//! ```ignore
//! use messaging::{effect, ClientConfig, EffectRegistry, Event, Microservice,
//!     MessagingClient, QueueBroker, QueueTransport, ServerConfig};
//! use serde_json::json;
//!
//! let broker = QueueBroker::new("amqp://localhost:5672");
//!
//! let effects = EffectRegistry::new().on(
//!     "RPC_TEST",
//!     effect::reply(|event: Event, _ctx| async move {
//!         let n: i64 = event.payload_as()?;
//!         Ok(Event::new("RPC_TEST_RESULT", json!(n + 1)))
//!     }),
//! );
//!
//! let server = Microservice::new(
//!     QueueTransport::new(&broker),
//!     ServerConfig::new("amqp://localhost:5672", "test_queue_server"),
//! )
//! .with_effects(effects)
//! .run()
//! .await?;
//!
//! let client = MessagingClient::connect(
//!     QueueTransport::new(&broker),
//!     ClientConfig::new("amqp://localhost:5672"),
//! )
//! .await?;
//!
//! let reply = client
//!     .send_message("test_queue_server", Event::new("RPC_TEST", json!(1)))
//!     .await?;
//! assert_eq!(reply.payload, json!(2));
//!
//! client.close().await?;
//! server.close().await?;
//! ```

pub mod client;
pub mod codec;
pub mod config;
mod consumer;
pub mod effect;
pub mod error;
pub mod event;
pub mod listener;
pub mod message;
pub mod registry;
pub mod server;
pub mod status;
pub mod status_logger;
pub mod transport;

pub use client::{EventSubscription, MessagingClient};
pub use codec::{Codec, JsonCodec};
pub use config::{ClientConfig, QueueOptions, ReconnectPolicy, ServerConfig, DEFAULT_REPLY_TIMEOUT};
pub use effect::{EffectContext, EffectRegistry, Effect, EventStream, PayloadValidator};
pub use error::{ErrorInfo, MessagingError, Result};
pub use event::{CorrelationId, Event, EventMetadata};
pub use listener::{ListenerOutcome, ListenerStats, MessageListener};
pub use message::{Acknowledger, Delivery, InboundMessage, NoAck, TransportMessage};
pub use registry::{CorrelationRegistry, PendingReply, RegistryStats};
pub use server::{DrainReport, Microservice, RunningServer};
pub use status::{ConnectionState, StatusEvent, StatusPhase, StatusTracker, Transition};
pub use transport::{
    ConnectionHandle, InboundStream, PubSubBroker, PubSubTransport, QueueBroker, QueueTransport,
    RawStatus, Transport, TransportKind,
};
#[cfg(feature = "amqp")]
pub use transport::AmqpTransport;
#[cfg(feature = "nats")]
pub use transport::NatsTransport;
#[cfg(feature = "redis")]
pub use transport::RedisTransport;
