//! Logs facade status events.
//!
//! Connection changes and errors are rendered one line each, tagged with the
//! channel they concern and named after the facade that owns the connection. Deduplication already happened upstream, so every
//! event received here is logged.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::status::{StatusEvent, StatusPhase};

/// Which facade a status logger speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn connection_line(role: Role, phase: StatusPhase, host: &str) -> Option<String> {
    match phase {
        StatusPhase::Connect => Some(format!("Connected {role} to host: {host}")),
        StatusPhase::Disconnect => Some(format!("Disconnected {role} from host: {host}")),
        StatusPhase::Error => None,
    }
}

/// Log one status event on behalf of `role`.
pub fn log_status(role: Role, event: &StatusEvent) {
    match event {
        StatusEvent::Status {
            phase: StatusPhase::Error,
            host,
            channel,
        } => error!(tag = %channel, host = %host, role = %role, "status error"),
        StatusEvent::Status {
            phase,
            host,
            channel,
        } => {
            if let Some(line) = connection_line(role, *phase, host) {
                if *phase == StatusPhase::Connect {
                    info!(tag = %channel, "{}", line);
                } else {
                    error!(tag = %channel, "{}", line);
                }
            }
        }
        StatusEvent::Error { error, channel } => {
            error!(tag = %channel, "{}, {}", error.name, error.message)
        }
    }
}

/// Log every event from `events` until `cancel` fires or the sender is gone.
pub fn spawn_status_logger(
    role: Role,
    mut events: broadcast::Receiver<StatusEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => received,
            };
            match received {
                Ok(event) => log_status(role, &event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "status logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
