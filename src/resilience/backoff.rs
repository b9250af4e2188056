//! # Exponential Backoff
//!
//! Shared delay calculator for retry scheduling, broker reconnects, and
//! external-job polling. Delay grows as base * 2^attempt, capped, with
//! optional jitter to spread retries from concurrent workers.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound on any single delay
    pub cap: Duration,
    /// Add up to 25% random jitter when true
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(600),
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay for the given zero-based attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        // Saturate the shift so large attempt counts can't overflow.
        let multiplier = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let raw_ms = (self.base.as_millis() as u64).saturating_mul(multiplier);
        let capped = Duration::from_millis(raw_ms).min(self.cap);

        if self.jitter && !capped.is_zero() {
            let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4);
            (capped + Duration::from_millis(jitter_ms)).min(self.cap)
        } else {
            capped
        }
    }
}

/// Growing poll interval for external-job status checks. Starts at `base`
/// and doubles on each poll up to `cap`, so slower jobs are polled less
/// aggressively over time.
#[derive(Debug, Clone)]
pub struct PollInterval {
    current: Duration,
    cap: Duration,
}

impl PollInterval {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            current: base.min(cap),
            cap,
        }
    }

    /// The interval to sleep before the next poll, then grow it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delay_doubles_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(600));
        assert_eq!(policy.delay(0), Duration::from_secs(2));
        assert_eq!(policy.delay(1), Duration::from_secs(4));
        assert_eq!(policy.delay(2), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(600));
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(600));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(600));
    }

    #[test]
    fn poll_interval_grows_to_cap() {
        let mut poll = PollInterval::new(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(poll.next_delay(), Duration::from_secs(5));
        assert_eq!(poll.next_delay(), Duration::from_secs(10));
        assert_eq!(poll.next_delay(), Duration::from_secs(20));
        assert_eq!(poll.next_delay(), Duration::from_secs(40));
        assert_eq!(poll.next_delay(), Duration::from_secs(60));
        assert_eq!(poll.next_delay(), Duration::from_secs(60));
    }

    proptest! {
        #[test]
        fn delay_is_monotonic_and_capped(attempt in 0u32..64) {
            let policy = BackoffPolicy::new(
                Duration::from_millis(100),
                Duration::from_secs(30),
            );
            let current = policy.delay(attempt);
            let next = policy.delay(attempt + 1);
            prop_assert!(current <= next);
            prop_assert!(next <= Duration::from_secs(30));
        }
    }
}
