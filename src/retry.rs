//! Retry and Backoff
//!
//! Bounded exponential backoff with jitter for coordination operations.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};

/// Retry budget for a coordination operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
    /// Total attempts, including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (0-based), with jitter in [delay/2, delay]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff);
        let millis = base.as_millis() as u64;
        if millis < 2 {
            return base;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(millis / 2..=millis))
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// Exhaustion is reported as `CoordinationUnavailable`.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation,
                        attempt + 1,
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    tracing::error!("{} failed after {} attempts: {}", operation, attempts, e);
                    return Err(Error::CoordinationUnavailable(format!(
                        "{} failed after {} attempts: {}",
                        operation, attempts, e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Unbounded backoff state for loops that never give up
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.backoff(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Forget past failures
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
