//! Bounded retry with exponential backoff for directory calls.
//!
//! The policy is a value: attempts, a backoff function and a predicate that
//! decides which failures are worth another try. [`RetryPolicy::run`] applies
//! it to any async operation, so every directory function shares exactly the
//! same retry behaviour.
//!
//! With the defaults (3 attempts, 500 ms base) the sleeps are 500 ms → 1 s,
//! for at most 1.5 s of back-off per call.

use super::TransportError;
use crate::config::DirectoryConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// How a retried operation finally failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryFailure<E> {
    /// The predicate rejected the error; no further attempts were made.
    Fatal(E),
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
}

/// Declarative retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first. Always ≥ 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Which errors deserve another attempt.
    pub retryable: fn(&TransportError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DirectoryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DirectoryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            retryable: TransportError::is_transient,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Sleep before attempt `attempt + 1`, given that `attempt` (1-based)
    /// just failed: `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        mut op: F,
    ) -> Result<T, RetryFailure<TransportError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if !(self.retryable)(&e) => return Err(RetryFailure::Fatal(e)),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(RetryFailure::Exhausted {
                        attempts: attempt,
                        last: e,
                    })
                }
                Err(e) => {
                    let backoff = self.delay_for(attempt);
                    warn!(
                        "{}: attempt {}/{} failed: {}; retrying in {}ms",
                        label,
                        attempt,
                        self.max_attempts,
                        e,
                        backoff.as_millis()
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
