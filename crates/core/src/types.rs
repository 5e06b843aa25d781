use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an accepted webhook event.
///
/// `Failed` classifies a handler attempt that did not succeed. It is reported in
/// summaries but never stored as a resting state: the queue resolves it to
/// `Pending` (retry) or `DeadLettered` within the same transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    DeadLettered,
}

impl EventState {
    /// Returns the canonical database representation for the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }

    /// Terminal states are never left once entered.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered)
    }

    /// Returns `true` when the edge `self -> next` is part of the event state machine.
    pub fn can_transition_to(self, next: EventState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InFlight)
                | (Self::InFlight, Self::Succeeded)
                | (Self::InFlight, Self::Pending)
                | (Self::InFlight, Self::Failed)
                | (Self::InFlight, Self::DeadLettered)
                | (Self::Failed, Self::Pending)
                | (Self::Failed, Self::DeadLettered)
        )
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "dead_lettered" => Ok(Self::DeadLettered),
            other => Err(format!("unknown event state: {other}")),
        }
    }
}

/// Webhook event owned by the durable queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    /// Monotonic enqueue sequence used for best-effort FIFO leasing.
    pub seq: i64,
    pub received_at: DateTime<Utc>,
    pub raw_payload: Vec<u8>,
    pub content_type: Option<String>,
    pub signature_valid: bool,
    pub attempt_count: u32,
    pub state: EventState,
    /// Earliest instant the event may be leased again.
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn summary(&self) -> EventSummary {
        EventSummary {
            id: self.id.clone(),
            state: self.state,
            attempt_count: self.attempt_count,
            at: self.updated_at,
            detail: self.last_error.clone(),
        }
    }
}

/// Handle returned once an event has been durably enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHandle {
    pub id: String,
    pub seq: i64,
}

/// Exclusive, time-bounded claim of a worker on an in-flight event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub event_id: String,
    pub owner: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Event handed to a dispatch worker together with its lease.
#[derive(Debug, Clone)]
pub struct LeasedEvent {
    pub event: Event,
    pub lease: Lease,
}

/// Short description of an event used by the status surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: String,
    pub state: EventState,
    pub attempt_count: u32,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-state row counts as persisted by the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub succeeded: u64,
    pub dead_lettered: u64,
}

impl StateCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_flight + self.succeeded + self.dead_lettered
    }

    /// Events that still await a terminal state.
    pub fn queue_depth(&self) -> u64 {
        self.pending + self.in_flight
    }
}

/// Aggregate counters exposed to the monitoring surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub accepted: u64,
    pub rejected_invalid_signature: u64,
    pub rejected_duplicate: u64,
    pub succeeded: u64,
    pub failed_terminal: u64,
    pub retried: u64,
    pub leases_reclaimed: u64,
    pub queue_depth: u64,
    pub recent: Vec<EventSummary>,
    pub generated_at: DateTime<Utc>,
}
