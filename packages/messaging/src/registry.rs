//! Correlation registry for in-flight requests.
//!
//! Every RPC registers a slot under a fresh [`CorrelationId`] before its
//! request is published. The slot is resolved by the first of:
//!
//! - a reply carrying the same correlation id ([`CorrelationRegistry::resolve`])
//! - the deadline passing ([`CorrelationRegistry::expire`] or the waiter itself)
//! - an explicit [`CorrelationRegistry::fail`] / [`CorrelationRegistry::cancel`]
//!
//! Whoever removes the entry from the map owns the resolution, so a slot is
//! resolved at most once. Later replies for the same id are logged and
//! dropped.
//!
//! The map is a `DashMap`, so registrations and resolutions of different ids
//! do not contend on a single lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{MessagingError, Result};
use crate::event::{CorrelationId, Event};

/// Roughly 30 years, the same horizon tokio uses for unbounded sleeps.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn far_future(now: Instant) -> Instant {
    now.checked_add(FAR_FUTURE).unwrap_or(now)
}

struct PendingRequest {
    created_at: Instant,
    deadline: Instant,
    slot: oneshot::Sender<Result<Event>>,
}

impl PendingRequest {
    fn timeout_error(&self, correlation_id: &CorrelationId) -> MessagingError {
        MessagingError::Timeout {
            correlation_id: correlation_id.clone(),
            duration: self.deadline.saturating_duration_since(self.created_at),
        }
    }
}

#[derive(Default)]
struct Counters {
    registered: AtomicU64,
    resolved: AtomicU64,
    expired: AtomicU64,
    late_replies: AtomicU64,
}

/// Snapshot of registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub pending: usize,
    pub registered: u64,
    pub resolved: u64,
    pub expired: u64,
    pub late_replies: u64,
}

/// Map of pending requests keyed by correlation id. Cheap to clone.
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    pending: Arc<DashMap<CorrelationId, PendingRequest>>,
    counters: Arc<Counters>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request that times out `timeout` from now.
    pub fn register(&self, correlation_id: CorrelationId, timeout: Duration) -> Result<PendingReply> {
        let created_at = Instant::now();
        let deadline = created_at
            .checked_add(timeout)
            .unwrap_or_else(|| far_future(created_at));
        self.register_at(correlation_id, created_at, deadline)
    }

    fn register_at(
        &self,
        correlation_id: CorrelationId,
        created_at: Instant,
        deadline: Instant,
    ) -> Result<PendingReply> {
        let (slot, receiver) = oneshot::channel();
        match self.pending.entry(correlation_id.clone()) {
            Entry::Occupied(_) => return Err(MessagingError::DuplicateCorrelation(correlation_id)),
            Entry::Vacant(vacant) => {
                vacant.insert(PendingRequest {
                    created_at,
                    deadline,
                    slot,
                });
            }
        }
        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        trace!(cid = %correlation_id, "request registered");

        Ok(PendingReply {
            correlation_id,
            created_at,
            deadline,
            receiver,
            registry: self.clone(),
        })
    }

    /// Fulfil a pending request with its reply.
    ///
    /// Returns `false` (and logs) when nothing is pending under this id:
    /// the reply is late, duplicated or was never requested here.
    pub fn resolve(&self, correlation_id: &CorrelationId, reply: Event) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, request)) => {
                self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                trace!(cid = %correlation_id, "request resolved");
                let _ = request.slot.send(Ok(reply));
                true
            }
            None => {
                self.counters.late_replies.fetch_add(1, Ordering::Relaxed);
                debug!(cid = %correlation_id, event_type = %reply.event_type, "reply without pending request dropped");
                false
            }
        }
    }

    /// Fail a pending request.
    pub fn fail(&self, correlation_id: &CorrelationId, error: MessagingError) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, request)) => {
                let _ = request.slot.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drop a pending request without fulfilling it.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.remove(correlation_id).is_some()
    }

    /// Expire every request whose deadline has passed.
    pub fn expire(&self) -> usize {
        self.expire_at(Instant::now())
    }

    /// Expire every request whose deadline is at or before `now`.
    pub fn expire_at(&self, now: Instant) -> usize {
        let overdue: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        overdue
            .into_iter()
            .filter(|cid| self.expire_one(cid))
            .count()
    }

    /// Expire one request. Only the caller that removes the entry sends the
    /// timeout.
    fn expire_one(&self, correlation_id: &CorrelationId) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, request)) => {
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                debug!(cid = %correlation_id, "request expired");
                let error = request.timeout_error(correlation_id);
                let _ = request.slot.send(Err(error));
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            pending: self.pending.len(),
            registered: self.counters.registered.load(Ordering::Relaxed),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            late_replies: self.counters.late_replies.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Waiter side of a registered request.
///
/// Dropping it without waiting cancels the registration.
pub struct PendingReply {
    correlation_id: CorrelationId,
    created_at: Instant,
    deadline: Instant,
    receiver: oneshot::Receiver<Result<Event>>,
    registry: CorrelationRegistry,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the reply, a failure or the deadline, whichever comes first.
    pub async fn wait(mut self) -> Result<Event> {
        match tokio::time::timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.timeout_error()),
            Err(_) => {
                if self.registry.expire_one(&self.correlation_id) {
                    // The timeout was just sent into our own slot.
                    return Err(self.timeout_error());
                }
                // Resolved concurrently with the deadline.
                match self.receiver.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => Err(self.timeout_error()),
                }
            }
        }
    }

    fn timeout_error(&self) -> MessagingError {
        MessagingError::Timeout {
            correlation_id: self.correlation_id.clone(),
            duration: self.deadline.saturating_duration_since(self.created_at),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.registry.cancel(&self.correlation_id);
    }
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.correlation_id)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
