//! Bounded retry policies.
//!
//! Two things retry in the engine: optimistic appends that lost a race, and
//! catalog lookups that failed transiently. Neither ever retries unboundedly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first one included (minimum 1).
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_millis(2), Duration::from_millis(50))
    }
}

impl RetryPolicy {
    /// A single attempt, no retry.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Create a policy with linear backoff.
    pub fn linear(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted. Returns the last error and the attempt count.
    pub fn run<T, E>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, E>,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, (E, u32)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if is_retryable(&err) && self.should_retry(attempt) => {
                    std::thread::sleep(self.delay_for_attempt(attempt));
                }
                Err(err) => return Err((err, attempt)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let policy =
            RetryPolicy::exponential(5, Duration::from_millis(2), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(10));
    }

    #[test]
    fn linear_and_fixed_delays() {
        let linear = RetryPolicy::linear(3, Duration::from_millis(5), Duration::from_millis(12));
        assert_eq!(linear.delay_for_attempt(2), Duration::from_millis(10));
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(12));

        let fixed = RetryPolicy::fixed(3, Duration::from_millis(5));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_millis(5));
    }

    #[test]
    fn run_stops_after_max_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let mut calls = 0;
        let result: Result<(), (&str, u32)> = policy.run(
            |_| {
                calls += 1;
                Err("busy")
            },
            |_| true,
        );
        assert_eq!(result, Err(("busy", 3)));
        assert_eq!(calls, 3);
    }

    #[test]
    fn run_does_not_retry_permanent_errors() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let result: Result<(), (&str, u32)> = policy.run(|_| Err("gone"), |e| *e != "gone");
        assert_eq!(result, Err(("gone", 1)));
    }

    #[test]
    fn run_returns_first_success() {
        let policy = RetryPolicy::fixed(5, Duration::ZERO);
        let result: Result<u32, (&str, u32)> =
            policy.run(|attempt| if attempt < 3 { Err("busy") } else { Ok(attempt) }, |_| true);
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).max_attempts, 1);
    }
}
