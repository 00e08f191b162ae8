//! Retry ceiling and exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry ceiling stamped onto new jobs when the producer is not told otherwise.
/// The ceiling travels with each job row; the dispatcher reads it from there.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Backoff schedule used by the dispatcher for every job type.
///
/// The delay before the next attempt doubles with each prior attempt:
/// `base_delay * 2^retry_count`, capped at `max_delay`. With the defaults the
/// cap is never reached within [`DEFAULT_MAX_RETRIES`] attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// True when every delay up to the attempt that exhausts `max_retries`
    /// is still below the cap, so the schedule keeps doubling.
    pub fn is_uncapped_within(&self, max_retries: u32) -> bool {
        let last = max_retries.saturating_sub(1);
        let factor = 2u32.checked_pow(last).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .is_some_and(|d| d < self.max_delay)
    }

    /// Delay to wait after an attempt made when the job had `retry_count`
    /// prior attempts.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `chrono` flavour of [`delay_for`](Self::delay_for), for timestamp math.
    pub fn chrono_delay_for(&self, retry_count: u32) -> chrono::Duration {
        chrono::Duration::from_std(self.delay_for(retry_count)).unwrap_or_else(|_| chrono::Duration::days(365))
    }
}
