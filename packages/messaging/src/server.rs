//! Server facade.
//!
//! A [`Microservice`] consumes one destination and runs the effect pipeline
//! on every message. [`Microservice::run`] connects and returns a
//! [`RunningServer`]; [`RunningServer::close`] drains and disconnects.
//!
//! # Concurrency
//!
//! Messages are pulled from the transport one at a time, in order. Each is
//! handled on its own task, with at most `max_in_flight` handlers running;
//! the next message is not pulled until a slot is free.
//!
//! # Example
//!
//! ```ignore
//! let broker = QueueBroker::new("amqp://localhost:5672");
//! let server = Microservice::new(
//!     QueueTransport::new(&broker),
//!     ServerConfig::new("amqp://localhost:5672", "test_queue_server"),
//! )
//! .with_effects(effects)
//! .run()
//! .await?;
//!
//! // ...
//! server.close().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::config::ServerConfig;
use crate::consumer::resubscribe;
use crate::effect::EffectRegistry;
use crate::error::{MessagingError, Result};
use crate::listener::{ListenerContext, ListenerStats, MessageListener};
use crate::status::{ConnectionMonitor, ConnectionState, StatusEvent, STATUS_EVENT_CAPACITY};
use crate::status_logger::{spawn_status_logger, Role};
use crate::transport::{InboundStream, Transport};

/// What shutdown did with in-flight handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Handlers that finished within the grace period.
    pub completed: usize,
    /// Handlers cancelled when the grace period ran out.
    pub aborted: usize,
}

/// A service that has not started yet.
pub struct Microservice {
    transport: Arc<dyn Transport>,
    config: ServerConfig,
    listener: MessageListener,
    events: broadcast::Sender<StatusEvent>,
}

impl Microservice {
    pub fn new(transport: impl Transport, config: ServerConfig) -> Self {
        let (events, _) = broadcast::channel(STATUS_EVENT_CAPACITY);
        Self {
            transport: Arc::new(transport),
            config,
            listener: MessageListener::new(EffectRegistry::new()),
            events,
        }
    }

    pub fn with_effects(mut self, effects: EffectRegistry) -> Self {
        self.listener = self.listener.with_effects(effects);
        self
    }

    pub fn with_codec(mut self, codec: impl Codec) -> Self {
        self.listener = self.listener.with_codec(codec);
        self
    }

    /// Status and error events. Subscribing before `run()` observes the
    /// initial connect.
    pub fn status_events(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Connect, subscribe to the configured queue and start consuming.
    ///
    /// Fails if the initial connection or subscription fails.
    pub async fn run(self) -> Result<RunningServer> {
        let Microservice {
            transport,
            config,
            listener,
            events,
        } = self;

        let cancel = CancellationToken::new();
        let monitor = Arc::new(ConnectionMonitor::spawn(
            transport.clone(),
            &config.queue,
            config.reconnect.clone(),
            events.clone(),
            cancel.clone(),
        ));
        let logger = config
            .log_status
            .then(|| spawn_status_logger(Role::Server, events.subscribe(), cancel.clone()));

        monitor.mark_connecting();
        let handle = match transport.connect().await {
            Ok(handle) => handle,
            Err(err) => {
                cancel.cancel();
                return Err(err);
            }
        };

        let stream = match transport.consume(&config.queue).await {
            Ok(stream) => stream,
            Err(err) => {
                cancel.cancel();
                let _ = transport.disconnect().await;
                return Err(err);
            }
        };

        info!(
            host = %handle.host,
            queue = %config.queue,
            effects = listener.effects().len(),
            max_in_flight = config.max_in_flight,
            "messaging server running"
        );

        let config = Arc::new(config);
        let listener = Arc::new(listener);
        let ctx = Arc::new(ListenerContext {
            transport: transport.clone(),
            host: Arc::from(handle.host.as_str()),
            config: config.clone(),
            events: events.clone(),
        });
        let consumer = tokio::spawn(consume_loop(
            stream,
            listener.clone(),
            ctx,
            monitor.clone(),
            cancel.clone(),
        ));

        Ok(RunningServer {
            transport,
            config,
            listener,
            monitor,
            events,
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
            consumer,
            logger,
        })
    }
}

impl std::fmt::Debug for Microservice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Microservice")
            .field("transport", &self.transport.kind())
            .field("queue", &self.config.queue)
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

/// A started service. Dropping it stops consumption without draining.
pub struct RunningServer {
    transport: Arc<dyn Transport>,
    config: Arc<ServerConfig>,
    listener: Arc<MessageListener>,
    monitor: Arc<ConnectionMonitor>,
    events: broadcast::Sender<StatusEvent>,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
    consumer: JoinHandle<DrainReport>,
    logger: Option<JoinHandle<()>>,
}

impl RunningServer {
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

    pub fn stats(&self) -> ListenerStats {
        self.listener.stats()
    }

    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    /// Stop consuming, drain in-flight handlers for up to the grace period,
    /// cancel the rest, then disconnect.
    ///
    /// Fails with [`MessagingError::Shutdown`] if the transport does not
    /// close within `disconnect_timeout`.
    pub async fn close(self) -> Result<DrainReport> {
        info!(queue = %self.config.queue, "closing messaging server");
        self.cancel.cancel();

        let report = match self.consumer.await {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "consumer task ended abnormally");
                DrainReport::default()
            }
        };
        self.monitor.abort();
        if let Some(logger) = self.logger {
            let _ = logger.await;
        }

        match tokio::time::timeout(self.config.disconnect_timeout, self.transport.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return Err(MessagingError::Shutdown {
                    message: format!("disconnect failed: {err}"),
                })
            }
            Err(_) => {
                return Err(MessagingError::Shutdown {
                    message: format!(
                        "disconnect did not complete within {:?}",
                        self.config.disconnect_timeout
                    ),
                })
            }
        }

        info!(
            queue = %self.config.queue,
            completed = report.completed,
            aborted = report.aborted,
            "messaging server closed"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for RunningServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningServer")
            .field("queue", &self.config.queue)
            .field("state", &self.monitor.state())
            .finish_non_exhaustive()
    }
}

async fn consume_loop(
    mut stream: InboundStream,
    listener: Arc<MessageListener>,
    ctx: Arc<ListenerContext>,
    monitor: Arc<ConnectionMonitor>,
    cancel: CancellationToken,
) -> DrainReport {
    let config = ctx.config.clone();
    let permits = Arc::new(Semaphore::new(config.max_in_flight));
    let mut in_flight = JoinSet::new();

    loop {
        // Reap finished handlers
        while in_flight.try_join_next().is_some() {}

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(inbound) => {
                debug!(queue = %config.queue, redelivered = inbound.is_redelivered(), "message received");
                let listener = listener.clone();
                let ctx = ctx.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    listener.process(inbound, &ctx).await;
                });
            }
            None => {
                drop(permit);
                warn!(queue = %config.queue, "consumer stream ended, waiting for reconnection");
                match resubscribe(&ctx.transport, &config.queue, &monitor, &config.reconnect, &cancel).await {
                    Some(resubscribed) => stream = resubscribed,
                    None => break,
                }
            }
        }
    }

    drop(stream);
    drain(in_flight, config.shutdown_grace).await
}

async fn drain(mut in_flight: JoinSet<()>, grace: Duration) -> DrainReport {
    let mut completed = 0;
    if !in_flight.is_empty() {
        debug!(in_flight = in_flight.len(), ?grace, "draining handlers");
    }

    let _ = tokio::time::timeout(grace, async {
        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "handler task failed");
            }
            completed += 1;
        }
    })
    .await;

    let aborted = in_flight.len();
    if aborted > 0 {
        warn!(aborted, ?grace, "grace period elapsed, cancelling handlers");
        in_flight.abort_all();
        while in_flight.join_next().await.is_some() {}
    }

    DrainReport { completed, aborted }
}
