use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::handler::HandlerOutcome;
use crate::types::EventState;

pub const DEFAULT_JITTER_RATIO: f64 = 0.2;

/// Resolution of an in-flight event after a handler attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Succeeded,
    Retry {
        available_at: DateTime<Utc>,
        reason: String,
    },
    DeadLetter {
        reason: String,
    },
}

impl Transition {
    pub fn target_state(&self) -> EventState {
        match self {
            Self::Succeeded => EventState::Succeeded,
            Self::Retry { .. } => EventState::Pending,
            Self::DeadLetter { .. } => EventState::DeadLettered,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Succeeded => None,
            Self::Retry { reason, .. } | Self::DeadLetter { reason } => Some(reason),
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Retry { .. } => "retry",
            Self::DeadLetter { .. } => "dead_lettered",
        }
    }
}

/// Retry budget and exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            backoff_cap,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// `min(cap, base * 2^attempt_count)` before jitter.
    pub fn nominal_delay(&self, attempt_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt_count);
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_cap, |delay| delay.min(self.backoff_cap))
    }

    /// Backoff with random jitter in `±jitter_ratio` of the nominal delay.
    pub fn backoff_delay(&self, attempt_count: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.backoff_delay_with(attempt_count, sample)
    }

    /// Deterministic form of [`Self::backoff_delay`]; `sample` is clamped to `[-1, 1]`.
    pub fn backoff_delay_with(&self, attempt_count: u32, sample: f64) -> Duration {
        let nominal = self.nominal_delay(attempt_count).as_secs_f64();
        let sample = if sample.is_finite() {
            sample.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let jittered = nominal + nominal * self.jitter_ratio * sample;
        Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Decides where an event goes after an attempt.
    ///
    /// `attempt_count` is the number of attempts completed before this one.
    pub fn transition(
        &self,
        attempt_count: u32,
        outcome: &HandlerOutcome,
        now: DateTime<Utc>,
    ) -> Transition {
        let attempts_made = attempt_count.saturating_add(1);
        match outcome {
            HandlerOutcome::Success => Transition::Succeeded,
            HandlerOutcome::PermanentFailure(reason) => Transition::DeadLetter {
                reason: format!("permanent failure: {reason}"),
            },
            HandlerOutcome::RetryableFailure(reason) if attempts_made >= self.max_attempts => {
                Transition::DeadLetter {
                    reason: format!("retries exhausted after {attempts_made} attempts: {reason}"),
                }
            }
            HandlerOutcome::RetryableFailure(reason) => {
                let delay = self.backoff_delay(attempt_count);
                let available_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                Transition::Retry {
                    available_at,
                    reason: reason.clone(),
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(300))
    }
}
