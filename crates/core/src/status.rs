use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::types::{Event, EventState, EventSummary, StateCounts, StatusSnapshot};

pub const DEFAULT_RECENT_LIMIT: usize = 50;

/// Concurrency-safe counters backing the status surface.
///
/// Observability only: the queue remains the source of truth and the
/// registry is rebuilt from it on start via [`StatusRegistry::restore`].
#[derive(Debug)]
pub struct StatusRegistry {
    accepted: AtomicU64,
    rejected_invalid_signature: AtomicU64,
    rejected_duplicate: AtomicU64,
    succeeded: AtomicU64,
    failed_terminal: AtomicU64,
    retried: AtomicU64,
    leases_reclaimed: AtomicU64,
    queue_depth: AtomicU64,
    recent: Mutex<VecDeque<EventSummary>>,
    recent_limit: usize,
}

impl StatusRegistry {
    pub fn new(recent_limit: usize) -> Self {
        Self {
            accepted: AtomicU64::new(0),
            rejected_invalid_signature: AtomicU64::new(0),
            rejected_duplicate: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed_terminal: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            leases_reclaimed: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(recent_limit)),
            recent_limit,
        }
    }

    pub fn record_accepted(&self, event_id: &str, at: DateTime<Utc>) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
        self.push_recent(EventSummary {
            id: event_id.to_string(),
            state: EventState::Pending,
            attempt_count: 0,
            at,
            detail: None,
        });
    }

    pub fn record_invalid_signature(&self) {
        self.rejected_invalid_signature
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.rejected_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the state an event reached after `complete`.
    ///
    /// A retry is summarised as `Failed` since it describes the attempt that
    /// just failed; the stored event is back in `Pending`.
    pub fn record_transition(&self, event: &Event) {
        let mut summary = event.summary();
        match event.state {
            EventState::Succeeded => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                self.decrement_depth();
            }
            EventState::DeadLettered => {
                self.failed_terminal.fetch_add(1, Ordering::Relaxed);
                self.decrement_depth();
            }
            EventState::Pending | EventState::Failed => {
                self.retried.fetch_add(1, Ordering::Relaxed);
                summary.state = EventState::Failed;
            }
            EventState::InFlight => {}
        }
        self.push_recent(summary);
    }

    pub fn record_leases_reclaimed(&self, count: u64) {
        self.leases_reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Rebuilds counters from persisted queue state.
    ///
    /// Rejections are never persisted, so they restart from zero.
    pub fn restore(&self, counts: StateCounts, recent: Vec<EventSummary>) {
        self.accepted.store(counts.total(), Ordering::Relaxed);
        self.succeeded.store(counts.succeeded, Ordering::Relaxed);
        self.failed_terminal
            .store(counts.dead_lettered, Ordering::Relaxed);
        self.queue_depth
            .store(counts.queue_depth(), Ordering::Relaxed);

        let mut ring = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        ring.clear();
        ring.extend(recent.into_iter().take(self.recent_limit));
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> StatusSnapshot {
        let recent = self
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();

        StatusSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected_invalid_signature: self.rejected_invalid_signature.load(Ordering::Relaxed),
            rejected_duplicate: self.rejected_duplicate.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed_terminal: self.failed_terminal.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            leases_reclaimed: self.leases_reclaimed.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            recent,
            generated_at: now,
        }
    }

    fn decrement_depth(&self) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| {
                Some(depth.saturating_sub(1))
            });
    }

    // Newest first.
    fn push_recent(&self, summary: EventSummary) {
        if self.recent_limit == 0 {
            return;
        }
        let mut ring = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        ring.push_front(summary);
        ring.truncate(self.recent_limit);
    }
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_LIMIT)
    }
}
