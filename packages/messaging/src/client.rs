//! Client facade.
//!
//! [`MessagingClient`] sends requests and waits for correlated replies, or
//! emits fire-and-forget events. On connect it creates a private reply
//! destination and consumes it for the lifetime of the client; every reply
//! received there resolves the pending request with the same correlation
//! id.
//!
//! These helpers do NOT guarantee a reply exists. A request whose reply
//! never comes resolves with [`MessagingError::Timeout`].

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::codec::{Codec, JsonCodec};
use crate::config::ClientConfig;
use crate::consumer::resubscribe;
use crate::error::{MessagingError, Result};
use crate::event::{CorrelationId, Event};
use crate::registry::{CorrelationRegistry, RegistryStats};
use crate::status::{ConnectionMonitor, ConnectionState, StatusEvent, STATUS_EVENT_CAPACITY};
use crate::status_logger::{spawn_status_logger, Role};
use crate::transport::{InboundStream, Transport};

/// Decoded events from [`MessagingClient::subscribe`].
pub type EventSubscription = BoxStream<'static, Result<Event>>;

/// Sends requests and events over one transport.
pub struct MessagingClient {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    codec: Arc<dyn Codec>,
    registry: CorrelationRegistry,
    reply_to: String,
    monitor: Arc<ConnectionMonitor>,
    events: broadcast::Sender<StatusEvent>,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
    tasks: Vec<JoinHandle<()>>,
}

impl MessagingClient {
    /// Connect with the JSON codec.
    pub async fn connect(transport: impl Transport, config: ClientConfig) -> Result<Self> {
        Self::connect_with_codec(transport, config, JsonCodec).await
    }

    pub async fn connect_with_codec(
        transport: impl Transport,
        config: ClientConfig,
        codec: impl Codec,
    ) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let codec: Arc<dyn Codec> = Arc::new(codec);
        let (events, _) = broadcast::channel(STATUS_EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let monitor = Arc::new(ConnectionMonitor::spawn(
            transport.clone(),
            &config.channel,
            config.reconnect.clone(),
            events.clone(),
            cancel.clone(),
        ));

        let mut tasks = Vec::new();
        if config.log_status {
            tasks.push(spawn_status_logger(
                Role::Client,
                events.subscribe(),
                cancel.clone(),
            ));
        }

        monitor.mark_connecting();
        let setup = async {
            let handle = transport.connect().await?;
            let reply_to = transport.reply_destination().await?;
            let stream = transport.consume(&reply_to).await?;
            Ok::<_, MessagingError>((handle, reply_to, stream))
        };
        let (handle, reply_to, stream) = match setup.await {
            Ok(setup) => setup,
            Err(err) => {
                cancel.cancel();
                let _ = transport.disconnect().await;
                return Err(err);
            }
        };

        let registry = CorrelationRegistry::new();
        tasks.push(tokio::spawn(reply_loop(
            stream,
            ReplyContext {
                transport: transport.clone(),
                codec: codec.clone(),
                registry: registry.clone(),
                monitor: monitor.clone(),
                events: events.clone(),
                reply_to: reply_to.clone(),
                config: config.clone(),
            },
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(sweep(
            registry.clone(),
            config.sweep_interval,
            cancel.clone(),
        )));

        info!(host = %handle.host, reply_to = %reply_to, "messaging client connected");

        Ok(Self {
            transport,
            config,
            codec,
            registry,
            reply_to,
            monitor,
            events,
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
            tasks,
        })
    }

    /// Send a request and wait for its reply, up to the configured timeout.
    pub async fn send_message(&self, destination: &str, event: Event) -> Result<Event> {
        self.send_message_timeout(destination, event, self.config.reply_timeout)
            .await
    }

    /// Send a request and wait for its reply, up to `timeout`.
    pub async fn send_message_timeout(
        &self,
        destination: &str,
        mut event: Event,
        timeout: Duration,
    ) -> Result<Event> {
        let cid = CorrelationId::new();
        event.metadata.correlation_id = Some(cid.clone());
        event.metadata.reply_to = Some(self.reply_to.clone());
        let message = self.codec.encode_message(&event)?;

        // Register before publishing so a fast reply cannot be missed
        let pending = self.registry.register(cid.clone(), timeout)?;

        debug!(cid = %cid, destination, event_type = %event.event_type, "sending request");
        // Dropping `pending` on failure cancels the registration
        self.transport.publish(destination, message).await?;

        pending.wait().await
    }

    /// Publish an event without waiting for any reply.
    pub async fn emit_message(&self, destination: &str, mut event: Event) -> Result<()> {
        event.metadata.correlation_id = None;
        event.metadata.reply_to = None;
        let message = self.codec.encode_message(&event)?;

        debug!(destination, event_type = %event.event_type, "emitting event");
        self.transport.publish(destination, message).await
    }

    /// Consume a destination as a stream of decoded events.
    ///
    /// Every delivery is acked once decoded or found undecodable. The stream
    /// ends when the connection is lost; it does not resubscribe.
    pub async fn subscribe(&self, destination: &str) -> Result<EventSubscription> {
        let stream = self.transport.consume(destination).await?;
        let codec = self.codec.clone();
        debug!(destination, "subscribed");

        Ok(Box::pin(stream.then(move |inbound| {
            let codec = codec.clone();
            async move {
                let (message, delivery) = inbound.into_parts();
                let decoded = codec.decode_message(&message);
                if let Err(err) = delivery.ack().await {
                    warn!(error = %err, "failed to ack event");
                }
                decoded
            }
        })))
    }

    /// Destination replies are consumed from.
    pub fn reply_destination(&self) -> &str {
        &self.reply_to
    }

    pub fn pending_requests(&self) -> usize {
        self.registry.len()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn status_events(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.monitor.state()
    }

    /// Wait up to `timeout` for the connection to be up.
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.monitor.wait_connected(&self.cancel))
            .await
            .unwrap_or(false)
    }

    /// Stop background tasks and disconnect.
    pub async fn close(self) -> Result<()> {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        self.monitor.abort();

        match tokio::time::timeout(self.config.disconnect_timeout, self.transport.disconnect()).await {
            Ok(Ok(())) => {
                info!(reply_to = %self.reply_to, "messaging client closed");
                Ok(())
            }
            Ok(Err(err)) => Err(MessagingError::Shutdown {
                message: format!("disconnect failed: {err}"),
            }),
            Err(_) => Err(MessagingError::Shutdown {
                message: format!(
                    "disconnect did not complete within {:?}",
                    self.config.disconnect_timeout
                ),
            }),
        }
    }
}

impl std::fmt::Debug for MessagingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingClient")
            .field("transport", &self.transport.kind())
            .field("reply_to", &self.reply_to)
            .field("pending", &self.registry.len())
            .finish_non_exhaustive()
    }
}

struct ReplyContext {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    registry: CorrelationRegistry,
    monitor: Arc<ConnectionMonitor>,
    events: broadcast::Sender<StatusEvent>,
    reply_to: String,
    config: ClientConfig,
}

async fn reply_loop(mut stream: InboundStream, ctx: ReplyContext, cancel: CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        let Some(inbound) = next else {
            warn!(reply_to = %ctx.reply_to, "reply stream ended, waiting for reconnection");
            match resubscribe(&ctx.transport, &ctx.reply_to, &ctx.monitor, &ctx.config.reconnect, &cancel).await {
                Some(resubscribed) => {
                    stream = resubscribed;
                    continue;
                }
                None => break,
            }
        };

        let (message, delivery) = inbound.into_parts();
        match ctx.codec.decode_message(&message) {
            Ok(reply) => match reply.metadata.correlation_id.clone() {
                Some(cid) => {
                    ctx.registry.resolve(&cid, reply);
                }
                None => {
                    warn!(event_type = %reply.event_type, "reply without correlation id dropped");
                }
            },
            Err(err) => {
                warn!(error = %err, "undecodable reply dropped");
                let _ = ctx.events.send(StatusEvent::error(&err, &ctx.config.channel));
            }
        }
        if let Err(err) = delivery.ack().await {
            warn!(error = %err, "failed to ack reply");
        }
    }
}

async fn sweep(registry: CorrelationRegistry, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let expired = registry.expire();
                if expired > 0 {
                    debug!(expired, "expired pending requests");
                }
            }
        }
    }
}
