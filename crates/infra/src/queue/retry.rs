//! Retry/backoff policy for failed attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^n
    #[default]
    Exponential,
}

/// What happens to a queue item after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `queued`, eligible again at `scheduled_at`.
    Requeue {
        attempts: u32,
        delay: Duration,
        scheduled_at: DateTime<Utc>,
    },
    /// Terminally `failed`.
    Exhausted { attempts: u32 },
}

/// Retry policy configuration.
///
/// The decision is based solely on the attempt counter; executor
/// `retriable` hints do not influence it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after a failure with zero prior attempts.
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Delay for a failure observed with `attempts_before` prior attempts.
    ///
    /// With the default policy this is `min(60s, 1s * 2^n)`.
    pub fn delay_for_attempt(&self, attempts_before: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempts_before).unwrap_or(u64::MAX);
                base_ms.saturating_mul(factor).min(max_ms)
            }
        };

        Duration::from_millis(delay_ms)
    }

    /// Decide the fate of an item that just failed.
    ///
    /// The attempt counter is incremented first; the item is requeued only
    /// while the incremented count is still below `max_attempts`.
    pub fn decide(
        &self,
        attempts_before: u32,
        max_attempts: u32,
        finished_at: DateTime<Utc>,
    ) -> RetryDecision {
        let attempts = attempts_before.saturating_add(1).min(max_attempts.max(1));
        if attempts < max_attempts {
            let delay = self.delay_for_attempt(attempts_before);
            let scheduled_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|offset| finished_at.checked_add_signed(offset))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            RetryDecision::Requeue {
                attempts,
                delay,
                scheduled_at,
            }
        } else {
            RetryDecision::Exhausted { attempts }
        }
    }
}
