//! Pending-request table shared by waiters, the reply dispatcher and the sweeper.
//!
//! Every path that finishes a request (reply delivery, timeout, cancellation,
//! shutdown) does so by removing the entry from the map first; the `DashMap`
//! removal is the single point that decides which path wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use mediator_core::header_names as names;
use mediator_core::{MediationError, Message};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Outcome handed to whoever waits for a reply.
pub type ReplyOutcome = Result<Message, MediationError>;

/// Completion callback for asynchronous requests.
pub type CorrelationCallback = Box<dyn FnOnce(ReplyOutcome) + Send + 'static>;

/// Result of handing an inbound reply to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The reply completed a pending request.
    Delivered,
    /// No pending request matched; the reply was discarded.
    Orphaned,
}

pub(crate) enum ReplySlot {
    Waiter(oneshot::Sender<ReplyOutcome>),
    // Mutex only to make the entry `Sync`; it is never contended.
    Callback(parking_lot::Mutex<CorrelationCallback>),
}

pub(crate) struct PendingEntry {
    slot: ReplySlot,
    reply_to: String,
    timeout: Duration,
    deadline: Instant,
}

impl PendingEntry {
    pub(crate) fn new(slot: ReplySlot, reply_to: String, timeout: Duration) -> Self {
        Self {
            slot,
            reply_to,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    fn complete(self, outcome: ReplyOutcome) {
        match self.slot {
            ReplySlot::Waiter(tx) => {
                // The waiter may already be gone (dropped future).
                let _ = tx.send(outcome);
            }
            ReplySlot::Callback(callback) => (callback.into_inner())(outcome),
        }
    }
}

pub(crate) fn timeout_error(correlation_id: &str, timeout: Duration) -> MediationError {
    MediationError::CorrelationTimeout {
        correlation_id: correlation_id.to_string(),
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
}

#[derive(Default)]
pub(crate) struct PendingTable {
    entries: DashMap<String, PendingEntry>,
    completed: AtomicU64,
    orphaned: AtomicU64,
    timed_out: AtomicU64,
}

impl PendingTable {
    pub(crate) fn insert(&self, correlation_id: String, entry: PendingEntry) {
        self.entries.insert(correlation_id, entry);
    }

    /// Removes an entry without completing it. True if this call removed it.
    pub(crate) fn discard(&self, correlation_id: &str) -> bool {
        self.entries.remove(correlation_id).is_some()
    }

    pub(crate) fn contains(&self, correlation_id: &str) -> bool {
        self.entries.contains_key(correlation_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn record_timeout(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mediator_correlation_timeouts_total").increment(1);
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub(crate) fn orphaned(&self) -> u64 {
        self.orphaned.load(Ordering::Relaxed)
    }

    pub(crate) fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    /// Routes a reply to its pending request by correlation id.
    pub(crate) fn deliver(&self, reply: Message) -> DeliveryOutcome {
        let Some(correlation_id) = reply
            .headers()
            .get_str(names::CORRELATION_ID)
            .map(str::to_string)
        else {
            self.orphan(None);
            return DeliveryOutcome::Orphaned;
        };

        match self.entries.remove(&correlation_id) {
            Some((_, entry)) => {
                tracing::trace!(
                    correlation_id = %correlation_id,
                    reply_to = %entry.reply_to,
                    "reply delivered"
                );
                entry.complete(Ok(reply));
                self.completed.fetch_add(1, Ordering::Relaxed);
                DeliveryOutcome::Delivered
            }
            None => {
                self.orphan(Some(&correlation_id));
                DeliveryOutcome::Orphaned
            }
        }
    }

    fn orphan(&self, correlation_id: Option<&str>) {
        self.orphaned.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mediator_orphan_replies_total").increment(1);
        tracing::warn!(
            correlation_id = correlation_id.unwrap_or("<missing>"),
            "discarding reply with no pending request"
        );
    }

    /// Completes one entry with an error, if it is still pending.
    pub(crate) fn fail(&self, correlation_id: &str, error: MediationError) -> bool {
        match self.entries.remove(correlation_id) {
            Some((_, entry)) => {
                entry.complete(Err(error));
                true
            }
            None => false,
        }
    }

    /// Times out every entry whose deadline is at or before `now`.
    pub(crate) fn expire(&self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut count = 0;
        for correlation_id in expired {
            if let Some((_, entry)) = self
                .entries
                .remove_if(&correlation_id, |_, entry| entry.deadline <= now)
            {
                let error = timeout_error(&correlation_id, entry.timeout);
                entry.complete(Err(error));
                self.record_timeout();
                count += 1;
            }
        }
        count
    }

    /// Fails every pending entry with `Cancelled`.
    pub(crate) fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter(|id| {
                self.fail(
                    id,
                    MediationError::Cancelled {
                        correlation_id: id.clone(),
                    },
                )
            })
            .count()
    }
}
