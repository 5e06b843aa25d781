//! Domain layer for webhook ingestion and dispatch.
//!
//! Everything here is free of I/O: storage, HTTP and task scheduling live in
//! the `storage` and `app` crates and drive these types.

pub mod dedupe;
pub mod handler;
pub mod identity;
pub mod retry;
pub mod signature;
pub mod status;
pub mod types;

pub use dedupe::{DedupeDecision, DedupeEntry, DedupeStore, MemoryDedupeStore};
pub use handler::{EventHandler, HandlerOutcome};
pub use identity::{resolve_event_id, EventIdentity, IdentityError, IdentitySource};
pub use retry::{RetryPolicy, Transition};
pub use signature::SignatureAlgorithm;
pub use status::StatusRegistry;
pub use types::{
    Event, EventHandle, EventState, EventSummary, Lease, LeasedEvent, StateCounts,
    StatusSnapshot,
};
