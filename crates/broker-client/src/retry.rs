//! Retry/backoff policy.
//!
//! A pure policy object: it computes delays and attempt budgets but performs
//! no I/O and no sleeping itself, so it can be unit tested in isolation and
//! shared between the producer, the consumer and the startup probe.

use std::time::Duration;

/// Exponential backoff with a multiplier and a cap.
///
/// `max_attempts` counts every try including the first one; a policy with
/// `max_attempts == 1` never retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to sleep before retry number `retry` (0-based: `delay_for(0)`
    /// is the delay between the first failure and the second attempt).
    ///
    /// Grows by `multiplier` per retry until capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// The sequence of delays between attempts; has `max_attempts - 1`
    /// entries.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(|retry| self.delay_for(retry))
    }
}
