//! Connection bookkeeping shared by the in-process brokers.
//!
//! A broker owns a [`ConnectionTable`]; every transport attached to it owns
//! a [`Session`]. Fault injection on the broker (`drop_connections`,
//! `set_available`) goes through the table, which cancels each live
//! connection token and reports the loss on that session's status stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ConnectionHandle, RawStatus, TransportKind};
use crate::error::{MessagingError, Result};

const STATUS_CAPACITY: usize = 64;

struct LiveConnection {
    token: CancellationToken,
    status: broadcast::Sender<RawStatus>,
    lost: Vec<RawStatus>,
}

pub(crate) struct ConnectionTable {
    available: AtomicBool,
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, LiveConnection>>,
}

impl ConnectionTable {
    pub(crate) fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub(crate) fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn open(
        &self,
        status: broadcast::Sender<RawStatus>,
        lost: Vec<RawStatus>,
    ) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        self.live.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            LiveConnection {
                token: token.clone(),
                status,
                lost,
            },
        );
        (id, token)
    }

    fn close(&self, id: u64) {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }

    /// Sever every live connection. Returns how many were dropped.
    pub(crate) fn drop_all(&self) -> usize {
        let dropped: Vec<LiveConnection> = self
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, conn)| conn)
            .collect();

        for conn in &dropped {
            conn.token.cancel();
            for raw in &conn.lost {
                let _ = conn.status.send(raw.clone());
            }
        }
        info!(connections = dropped.len(), "dropped broker connections");
        dropped.len()
    }
}

/// Status vocabulary a session reports with.
pub(crate) struct SessionCodes {
    pub connected: &'static [&'static str],
    pub lost: &'static [&'static str],
    pub closed: &'static str,
}

/// One transport's connection to an in-process broker.
pub(crate) struct Session {
    kind: TransportKind,
    host: String,
    table: Arc<ConnectionTable>,
    status: broadcast::Sender<RawStatus>,
    current: Mutex<Option<(u64, CancellationToken)>>,
    codes: SessionCodes,
}

impl Session {
    pub(crate) fn new(
        kind: TransportKind,
        host: impl Into<String>,
        table: Arc<ConnectionTable>,
        codes: SessionCodes,
    ) -> Self {
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        Self {
            kind,
            host: host.into(),
            table,
            status,
            current: Mutex::new(None),
            codes,
        }
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn connect(&self) -> Result<ConnectionHandle> {
        if !self.table.is_available() {
            return Err(MessagingError::connection(&self.host, "broker unreachable"));
        }

        let lost = self
            .codes
            .lost
            .iter()
            .map(|code| RawStatus::new(self.kind, *code, &self.host))
            .collect();
        let (id, token) = self.table.open(self.status.clone(), lost);

        let previous = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace((id, token));
        if let Some((old_id, old_token)) = previous {
            self.table.close(old_id);
            old_token.cancel();
        }

        debug!(kind = %self.kind, host = %self.host, connection = id, "connection opened");
        for code in self.codes.connected {
            let _ = self.status.send(RawStatus::new(self.kind, *code, &self.host));
        }

        Ok(ConnectionHandle {
            kind: self.kind,
            host: self.host.clone(),
        })
    }

    pub(crate) fn disconnect(&self) {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((id, token)) = current {
            self.table.close(id);
            token.cancel();
            debug!(kind = %self.kind, host = %self.host, connection = id, "connection closed");
            let _ = self
                .status
                .send(RawStatus::new(self.kind, self.codes.closed, &self.host));
        }
    }

    /// Token of the live connection, if any.
    pub(crate) fn live(&self) -> Option<CancellationToken> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|(_, token)| !token.is_cancelled())
            .map(|(_, token)| token.clone())
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RawStatus> {
        self.status.subscribe()
    }
}
