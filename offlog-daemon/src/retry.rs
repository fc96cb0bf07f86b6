//! Bounded retry budget for write and fsync attempts.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Exponential backoff: `base`, `2 * base`, `4 * base`, ... capped at `max_delay`.
    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(1),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: self.clone(),
            attempts: 1,
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(31) as u32;
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Tracks one operation's attempts. The first attempt is counted on creation.
pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryHandle {
    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay_for_attempt(self.attempts);
        self.attempts += 1;
        Some(delay)
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}
