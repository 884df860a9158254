//! Exponential backoff with a cap and random jitter.
//!
//! One policy type serves three purposes: the delay before a failed task is
//! retried, the sleep of an idle worker between polls, and the pause after
//! a broker call fails.

use std::time::Duration;

use rand::RngExt;

/// Delay policy: `min(base * 2^attempt, max)` plus up to `max_jitter`,
/// never exceeding `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_jitter: Duration,
}

impl Backoff {
    pub const fn new(base: Duration, max: Duration, max_jitter: Duration) -> Self {
        Self {
            base,
            max,
            max_jitter,
        }
    }

    /// Delay before retrying a failed task: 10s doubling up to 1h, jitter up to 5s.
    pub const fn retry_default() -> Self {
        Self::new(
            Duration::from_secs(10),
            Duration::from_secs(3600),
            Duration::from_secs(5),
        )
    }

    /// Idle worker sleep: 50ms doubling up to 1s, jitter up to 50ms.
    pub const fn poll_default() -> Self {
        Self::new(
            Duration::from_millis(50),
            Duration::from_secs(1),
            Duration::from_millis(50),
        )
    }

    /// Pause after an unavailable backing store: 100ms doubling up to 5s.
    pub const fn broker_default() -> Self {
        Self::new(
            Duration::from_millis(100),
            Duration::from_secs(5),
            Duration::from_millis(100),
        )
    }

    /// Deterministic part of the delay for the given attempt (0-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max)
    }

    /// Delay for the given attempt, including jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            let max_ms = self.max_jitter.as_millis() as u64;
            Duration::from_millis(rand::rng().random_range(0..=max_ms))
        };

        (self.base_delay(attempt) + jitter).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_doubles_until_cap() {
        let backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
            Duration::ZERO,
        );

        assert_eq!(backoff.base_delay(0), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(1), Duration::from_secs(2));
        assert_eq!(backoff.base_delay(3), Duration::from_secs(8));
        assert_eq!(backoff.base_delay(4), Duration::from_secs(10));
        assert_eq!(backoff.base_delay(200), Duration::from_secs(10));
    }

    #[test]
    fn test_delay_stays_within_bounds() {
        let backoff = Backoff::retry_default();

        for attempt in 0..20 {
            let delay = backoff.delay(attempt);
            assert!(delay >= backoff.base_delay(attempt));
            assert!(delay <= backoff.base_delay(attempt) + backoff.max_jitter);
            assert!(delay <= backoff.max);
        }
    }

    #[test]
    fn test_delay_without_jitter_is_deterministic() {
        let backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(1), Duration::ZERO);
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
    }
}
