//! Bounded exponential backoff.

use pgext_core::FetchConfig;
use std::time::Duration;

/// How many times a remote call is attempted and how long to wait in between.
///
/// The delay before retry `n` (0-based) is `base_delay * 2^n`, capped at
/// `max_delay`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` counts the first attempt and is at least 1.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay(), config.max_delay())
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Fresh backoff state for one operation.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempts: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&FetchConfig::default())
    }
}

/// Attempt bookkeeping for one operation under a [`RetryPolicy`].
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl Backoff {
    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempts left in the budget.
    pub fn remaining(&self) -> u32 {
        self.policy.max_attempts.saturating_sub(self.attempts)
    }

    /// Record the start of an attempt. Returns false once the budget is spent.
    pub fn start_attempt(&mut self) -> bool {
        if self.remaining() == 0 {
            return false;
        }
        self.attempts += 1;
        true
    }

    /// Delay before the next attempt after a transient failure, or `None` if
    /// the budget is exhausted.
    pub fn next_delay(&self) -> Option<Duration> {
        if self.attempts == 0 {
            return Some(Duration::ZERO);
        }
        (self.remaining() > 0).then(|| self.policy.delay_for(self.attempts - 1))
    }
}
