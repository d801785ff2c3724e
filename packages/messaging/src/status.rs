//! Connection state machine.
//!
//! Transports report broker-native status codes ([`RawStatus`]). This module
//! normalizes them through a per-transport table into a [`ConnectionState`]
//! and a small observable vocabulary of [`StatusEvent`]s:
//!
//! ```text
//!                 connect()             raw "connected"
//! Disconnected ─────────────► Connecting ──────────────► Connected
//!                                 ▲                      │      ▲
//!                                 │ backoff retry   raw  │      │ raw
//!                                 │                "lost"│      │ "connected"
//!                                 │                      ▼      │
//!                            ConnectionLost ◄──────── Reconnecting
//! ```
//!
//! Phase notifications are distinct-until-changed: a `connect` is only
//! emitted after a `disconnect` (or first), never twice in a row. Error
//! events are never coalesced.
//!
//! On `ConnectionLost` the [`ConnectionMonitor`] reconnects with exponential
//! backoff until its cancellation token fires. Failed attempts are reported
//! as `ConnectionError` events.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ReconnectPolicy;
use crate::error::{ErrorInfo, MessagingError};
use crate::transport::{
    nats_status, pubsub_status, queue_status, RawStatus, Transport, TransportKind,
};

/// Normalized connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The transport is recovering on its own.
    Reconnecting,
    /// The connection is gone; the monitor will reconnect.
    ConnectionLost,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::ConnectionLost => "connection_lost",
        };
        f.write_str(name)
    }
}

/// Observable phase of a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPhase {
    Connect,
    Disconnect,
    Error,
}

/// What observers of a facade see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Status {
        phase: StatusPhase,
        host: String,
        channel: String,
    },
    Error {
        error: ErrorInfo,
        channel: String,
    },
}

impl StatusEvent {
    pub fn phase(&self) -> StatusPhase {
        match self {
            StatusEvent::Status { phase, .. } => *phase,
            StatusEvent::Error { .. } => StatusPhase::Error,
        }
    }

    pub(crate) fn error(err: &MessagingError, channel: &str) -> Self {
        StatusEvent::Error {
            error: ErrorInfo::from(err),
            channel: channel.to_string(),
        }
    }
}

/// Capacity of a facade's status broadcast.
pub(crate) const STATUS_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Connected,
    Reconnecting,
    Lost,
    Closed,
    Error,
}

fn classify(kind: TransportKind, code: &str) -> Option<Signal> {
    let signal = match kind {
        TransportKind::Queue => match code {
            queue_status::CONNECTED | queue_status::CHANNEL_CONNECTED => Signal::Connected,
            queue_status::CONNECTION_LOST | queue_status::CHANNEL_CONNECTION_LOST => Signal::Lost,
            queue_status::CLOSED => Signal::Closed,
            queue_status::ERROR => Signal::Error,
            _ => return None,
        },
        TransportKind::PubSub => match code {
            pubsub_status::CONNECT | pubsub_status::READY => Signal::Connected,
            pubsub_status::RECONNECTING => Signal::Reconnecting,
            pubsub_status::CLOSE => Signal::Lost,
            pubsub_status::END => Signal::Closed,
            pubsub_status::ERROR => Signal::Error,
            _ => return None,
        },
        TransportKind::Nats => match code {
            nats_status::CONNECTED => Signal::Connected,
            nats_status::DISCONNECTED => Signal::Reconnecting,
            nats_status::CLOSED => Signal::Closed,
            nats_status::ERROR => Signal::Error,
            _ => return None,
        },
    };
    Some(signal)
}

/// Result of feeding one raw status to a [`StatusTracker`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Transition {
    /// New state, when it changed.
    pub state: Option<ConnectionState>,
    /// Event to publish, after deduplication.
    pub event: Option<StatusEvent>,
    /// The monitor should start reconnecting.
    pub reconnect: bool,
}

/// Pure transition logic of the state machine.
#[derive(Debug)]
pub struct StatusTracker {
    kind: TransportKind,
    channel: String,
    state: ConnectionState,
    last_phase: Option<StatusPhase>,
}

impl StatusTracker {
    pub fn new(kind: TransportKind, channel: impl Into<String>) -> Self {
        Self {
            kind,
            channel: channel.into(),
            state: ConnectionState::Disconnected,
            last_phase: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn observe(&mut self, raw: &RawStatus) -> Transition {
        let Some(signal) = classify(self.kind, raw.code) else {
            debug!(kind = %self.kind, code = raw.code, "unmapped transport status ignored");
            return Transition::default();
        };

        if signal == Signal::Error {
            let message = raw.detail.clone().unwrap_or_else(|| raw.code.to_string());
            return Transition {
                state: None,
                event: Some(StatusEvent::Error {
                    error: ErrorInfo::new("ConnectionError", message),
                    channel: self.channel.clone(),
                }),
                reconnect: false,
            };
        }

        let (state, phase) = match signal {
            Signal::Connected => (ConnectionState::Connected, StatusPhase::Connect),
            Signal::Reconnecting => (ConnectionState::Reconnecting, StatusPhase::Disconnect),
            Signal::Lost => (ConnectionState::ConnectionLost, StatusPhase::Disconnect),
            Signal::Closed | Signal::Error => (ConnectionState::Disconnected, StatusPhase::Disconnect),
        };

        let changed = self.state != state;
        self.state = state;

        let event = if self.last_phase != Some(phase) {
            self.last_phase = Some(phase);
            Some(StatusEvent::Status {
                phase,
                host: raw.host.clone(),
                channel: self.channel.clone(),
            })
        } else {
            trace!(code = raw.code, "duplicate status suppressed");
            None
        };

        Transition {
            state: changed.then_some(state),
            event,
            reconnect: changed && signal == Signal::Lost,
        }
    }
}

/// Runs a [`StatusTracker`] against a transport and drives reconnection.
pub(crate) struct ConnectionMonitor {
    state: watch::Receiver<ConnectionState>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    handle: JoinHandle<()>,
}

impl ConnectionMonitor {
    /// Subscribes to the transport's status stream before returning, so the
    /// first `connect()` after this call is observed.
    pub(crate) fn spawn(
        transport: Arc<dyn Transport>,
        channel: &str,
        policy: ReconnectPolicy,
        events: broadcast::Sender<StatusEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let mut raw_rx = transport.status_stream();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let state_tx = Arc::new(state_tx);
        let mut tracker = StatusTracker::new(transport.kind(), channel);
        let channel = channel.to_string();

        let task_state = state_tx.clone();
        let handle = tokio::spawn(async move {
            let mut reconnecting: Option<JoinHandle<()>> = None;
            loop {
                let raw = tokio::select! {
                    _ = cancel.cancelled() => break,
                    raw = raw_rx.recv() => raw,
                };
                let raw = match raw {
                    Ok(raw) => raw,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "status receiver lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let transition = tracker.observe(&raw);
                if let Some(state) = transition.state {
                    debug!(%state, code = raw.code, "connection state changed");
                    task_state.send_replace(state);
                }
                if let Some(event) = transition.event {
                    let _ = events.send(event);
                }
                if transition.reconnect && !cancel.is_cancelled() {
                    let running = reconnecting.as_ref().is_some_and(|task| !task.is_finished());
                    if !running {
                        reconnecting = Some(tokio::spawn(reconnect(
                            transport.clone(),
                            policy.clone(),
                            task_state.clone(),
                            events.clone(),
                            channel.clone(),
                            cancel.clone(),
                        )));
                    }
                }
            }
            if let Some(task) = reconnecting {
                task.abort();
            }
        });

        Self {
            state,
            state_tx,
            handle,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn mark_connecting(&self) {
        self.state_tx.send_replace(ConnectionState::Connecting);
    }

    /// Wait until connected. Returns `false` if cancelled first.
    pub(crate) async fn wait_connected(&self, cancel: &CancellationToken) -> bool {
        let mut state = self.state.clone();
        let connected = async move {
            state
                .wait_for(|state| *state == ConnectionState::Connected)
                .await
                .is_ok()
        };
        tokio::select! {
            _ = cancel.cancelled() => false,
            connected = connected => connected,
        }
    }

    pub(crate) fn abort(&self) {
        self.handle.abort();
    }
}

async fn reconnect(
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<StatusEvent>,
    channel: String,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        state.send_replace(ConnectionState::Connecting);
        match transport.connect().await {
            Ok(handle) => {
                info!(host = %handle.host, attempts = attempt + 1, "reconnected");
                return;
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                warn!(error = %err, attempt, ?delay, "reconnect attempt failed");
                let _ = events.send(StatusEvent::error(&err, &channel));
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(kind: TransportKind, code: &'static str) -> RawStatus {
        RawStatus::new(kind, code, "amqp://localhost:5672")
    }

    fn phase_of(transition: &Transition) -> Option<StatusPhase> {
        transition.event.as_ref().map(StatusEvent::phase)
    }

    #[test]
    fn queue_codes_collapse_into_one_connect() {
        let mut tracker = StatusTracker::new(TransportKind::Queue, "test_queue_server");

        let first = tracker.observe(&raw(TransportKind::Queue, queue_status::CONNECTED));
        let second = tracker.observe(&raw(TransportKind::Queue, queue_status::CHANNEL_CONNECTED));

        assert_eq!(phase_of(&first), Some(StatusPhase::Connect));
        assert_eq!(first.state, Some(ConnectionState::Connected));
        assert_eq!(second, Transition::default());
        assert_eq!(tracker.state(), ConnectionState::Connected);
    }

    #[test]
    fn loss_emits_one_disconnect_and_requests_reconnect() {
        let mut tracker = StatusTracker::new(TransportKind::Queue, "q");
        tracker.observe(&raw(TransportKind::Queue, queue_status::CONNECTED));

        let channel_lost =
            tracker.observe(&raw(TransportKind::Queue, queue_status::CHANNEL_CONNECTION_LOST));
        let connection_lost =
            tracker.observe(&raw(TransportKind::Queue, queue_status::CONNECTION_LOST));

        assert_eq!(phase_of(&channel_lost), Some(StatusPhase::Disconnect));
        assert!(channel_lost.reconnect);
        assert!(connection_lost.event.is_none());
        assert!(!connection_lost.reconnect);
    }

    #[test]
    fn repeated_raw_statuses_never_duplicate_phases() {
        let mut tracker = StatusTracker::new(TransportKind::PubSub, "events");
        let sequence = [
            pubsub_status::CONNECT,
            pubsub_status::READY,
            pubsub_status::READY,
            pubsub_status::RECONNECTING,
            pubsub_status::RECONNECTING,
            pubsub_status::CLOSE,
            pubsub_status::CONNECT,
            pubsub_status::READY,
        ];

        let phases: Vec<StatusPhase> = sequence
            .iter()
            .filter_map(|code| phase_of(&tracker.observe(&raw(TransportKind::PubSub, *code))))
            .collect();

        assert_eq!(
            phases,
            vec![StatusPhase::Connect, StatusPhase::Disconnect, StatusPhase::Connect]
        );
    }

    #[test]
    fn errors_are_reported_every_time() {
        let mut tracker = StatusTracker::new(TransportKind::PubSub, "events");
        let error = raw(TransportKind::PubSub, pubsub_status::ERROR).with_detail("ECONNREFUSED");

        for _ in 0..2 {
            let transition = tracker.observe(&error);
            assert_eq!(
                transition.event,
                Some(StatusEvent::Error {
                    error: ErrorInfo::new("ConnectionError", "ECONNREFUSED"),
                    channel: "events".into(),
                })
            );
            assert!(transition.state.is_none());
        }
    }

    #[test]
    fn transport_side_reconnects_do_not_trigger_the_monitor() {
        let mut tracker = StatusTracker::new(TransportKind::Nats, "subjects");
        tracker.observe(&raw(TransportKind::Nats, nats_status::CONNECTED));

        let disconnected = tracker.observe(&raw(TransportKind::Nats, nats_status::DISCONNECTED));
        assert_eq!(disconnected.state, Some(ConnectionState::Reconnecting));
        assert!(!disconnected.reconnect);

        let back = tracker.observe(&raw(TransportKind::Nats, nats_status::CONNECTED));
        assert_eq!(phase_of(&back), Some(StatusPhase::Connect));
    }

    #[test]
    fn unknown_codes_are_ignored() {
        let mut tracker = StatusTracker::new(TransportKind::Queue, "q");
        assert_eq!(tracker.observe(&raw(TransportKind::Queue, "BLOCKED")), Transition::default());
        assert_eq!(tracker.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn monitor_reconnects_after_loss() {
        use crate::transport::{QueueBroker, QueueTransport};
        use std::time::Duration;

        let broker = QueueBroker::new("amqp://localhost:5672");
        let transport: Arc<dyn Transport> = Arc::new(QueueTransport::new(&broker));
        let (events, mut rx) = broadcast::channel(STATUS_EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_millis(20),
        };
        let monitor = ConnectionMonitor::spawn(transport.clone(), "q", policy, events, cancel.clone());

        transport.connect().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().phase(), StatusPhase::Connect);

        broker.set_available(false);
        broker.drop_connections();
        assert_eq!(rx.recv().await.unwrap().phase(), StatusPhase::Disconnect);
        assert_eq!(rx.recv().await.unwrap().phase(), StatusPhase::Error);

        broker.set_available(true);
        let reconnected = loop {
            let event = rx.recv().await.unwrap();
            if event.phase() != StatusPhase::Error {
                break event;
            }
        };
        assert_eq!(reconnected.phase(), StatusPhase::Connect);
        assert!(
            tokio::time::timeout(Duration::from_secs(1), monitor.wait_connected(&cancel))
                .await
                .unwrap()
        );

        cancel.cancel();
    }
}
