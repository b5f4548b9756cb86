//! Retry: exponential backoff for connection setup, and the fixed-budget
//! invalid-stream retry state machine.

use std::future::Future;
use std::time::Duration;

use crate::error::RelayError;

/// Exponential backoff for connection setup.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy for polling a port that is expected to open shortly.
    pub fn port_probe() -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            multiplier: 1.5,
        }
    }

    /// Delay after the failed `attempt` (1-based), capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }

    /// Execute an async operation, retrying errors that are retryable.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, RelayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !e.is_retryable() || attempt >= self.max_attempts {
                        return Err(e);
                    }

                    tracing::debug!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Retrying after error"
                    );

                    tokio::time::sleep(self.backoff(attempt)).await;
                }
            }
        }
    }
}

/// Outcome of an invalid-stream signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Resend the same request after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Budget spent; surface one final error.
    Exhausted { attempts: u32 },
    /// The caller cancelled; do nothing further.
    Abandoned,
}

/// Attempt counter with a fixed delay, scoped to one logical send.
#[derive(Debug, Clone)]
pub struct InvalidStreamRetry {
    max_retries: u32,
    delay: Duration,
    retries: u32,
}

impl InvalidStreamRetry {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            retries: 0,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Start a new logical send.
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    pub fn on_invalid_stream(&mut self, cancelled: bool) -> RetryDecision {
        if cancelled {
            return RetryDecision::Abandoned;
        }
        if self.retries >= self.max_retries {
            return RetryDecision::Exhausted {
                attempts: self.retries + 1,
            };
        }
        self.retries += 1;
        RetryDecision::Retry {
            attempt: self.retries,
            delay: self.delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn three_invalid_streams_yield_two_retries_then_exhaustion() {
        let mut retry = InvalidStreamRetry::new(2, Duration::from_secs(1));
        assert_eq!(
            retry.on_invalid_stream(false),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            retry.on_invalid_stream(false),
            RetryDecision::Retry {
                attempt: 2,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            retry.on_invalid_stream(false),
            RetryDecision::Exhausted { attempts: 3 }
        );
        assert_eq!(
            retry.on_invalid_stream(false),
            RetryDecision::Exhausted { attempts: 3 }
        );
    }

    #[test]
    fn cancellation_abandons_without_spending_budget() {
        let mut retry = InvalidStreamRetry::new(2, Duration::from_secs(1));
        assert_eq!(retry.on_invalid_stream(true), RetryDecision::Abandoned);
        assert_eq!(retry.retries(), 0);
        retry.on_invalid_stream(false);
        retry.reset();
        assert_eq!(retry.retries(), 0);
    }

    #[test]
    fn port_probe_backoff_grows_to_its_cap() {
        let policy = RetryPolicy::port_probe();
        let millis: Vec<u128> = [1, 2, 30]
            .into_iter()
            .map(|attempt| policy.backoff(attempt).as_millis())
            .collect();
        assert_eq!(millis, vec![100, 150, 2_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn policy_retries_retryable_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();
        let counter = calls.clone();
        let result = policy
            .execute(|| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(RelayError::Transport("connection refused".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn policy_stops_on_non_retryable_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = RetryPolicy::default()
            .execute(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(RelayError::Configuration("bad".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
