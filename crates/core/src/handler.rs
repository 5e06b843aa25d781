use std::future::Future;

use crate::types::Event;

/// Result reported by a downstream handler for one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    RetryableFailure(String),
    PermanentFailure(String),
}

impl HandlerOutcome {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableFailure(_) => "retryable",
            Self::PermanentFailure(_) => "permanent",
        }
    }
}

/// Downstream consumer of verified events.
///
/// The same event may be delivered more than once (retries, lease expiry), so
/// implementations must be idempotent with respect to `event.id`.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: &Event) -> impl Future<Output = HandlerOutcome> + Send;
}
