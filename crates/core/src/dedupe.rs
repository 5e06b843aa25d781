use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

/// Outcome of recording an event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeDecision {
    /// First sighting; the caller now owns the id until it commits or forgets it.
    Fresh,
    /// Another request holds the id but has not confirmed it durable yet.
    InProgress,
    /// The id was committed after being durably stored.
    Duplicate,
}

impl DedupeDecision {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Record of a recently seen event identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupeEntry {
    pub event_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub committed: bool,
}

/// Replay protection keyed by event id.
///
/// `check_and_record` must be atomic: among concurrent callers presenting the
/// same id exactly one observes [`DedupeDecision::Fresh`]. Later callers see
/// [`DedupeDecision::InProgress`] until the owner calls `commit`.
pub trait DedupeStore: Send + Sync {
    fn check_and_record(&self, event_id: &str, now: DateTime<Utc>) -> DedupeDecision;

    /// Marks an id as durably stored.
    fn commit(&self, event_id: &str);

    /// Drops a previously recorded id so a retried request is treated as fresh.
    fn forget(&self, event_id: &str);

    /// Removes expired entries, returning how many were evicted.
    fn sweep(&self, now: DateTime<Utc>) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory dedupe store guarded by a single mutex.
///
/// Expired entries are treated as absent on lookup, so the periodic sweep only
/// bounds memory and never affects the decision.
#[derive(Debug)]
pub struct MemoryDedupeStore {
    entries: Mutex<HashMap<String, DedupeEntry>>,
    ttl: Duration,
}

impl MemoryDedupeStore {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(1)),
        }
    }

    pub fn entry(&self, event_id: &str) -> Option<DedupeEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_id)
            .cloned()
    }
}

impl DedupeStore for MemoryDedupeStore {
    fn check_and_record(&self, event_id: &str, now: DateTime<Utc>) -> DedupeDecision {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(event_id) {
            if existing.expires_at > now {
                return if existing.committed {
                    DedupeDecision::Duplicate
                } else {
                    DedupeDecision::InProgress
                };
            }
        }
        entries.insert(
            event_id.to_string(),
            DedupeEntry {
                event_id: event_id.to_string(),
                first_seen_at: now,
                expires_at: now
                    .checked_add_signed(self.ttl)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
                committed: false,
            },
        );
        DedupeDecision::Fresh
    }

    fn commit(&self, event_id: &str) {
        if let Some(entry) = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(event_id)
        {
            entry.committed = true;
        }
    }

    fn forget(&self, event_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(event_id);
    }

    fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
