//! Retry policies and the combinator every retrying call site goes through.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn disposition(&self) -> RetryDisposition;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait `step * n` after the n-th failed attempt.
    Linear { step: Duration },
    /// Wait `base * 2^(n-1)` after the n-th failed attempt, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Reaching the persistence backend. Cold-starting serverless databases can take
    /// tens of seconds to accept connections.
    pub fn connection() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear {
                step: Duration::from_secs(10),
            },
        }
    }

    /// Whole-batch attempts, each one on a fresh connection.
    pub fn batch() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear {
                step: Duration::from_secs(15),
            },
        }
    }

    pub fn http() -> Self {
        Self {
            max_attempts: 4,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(250),
                max: Duration::from_secs(5),
            },
        }
    }

    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Linear {
                step: Duration::ZERO,
            },
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            Backoff::Linear { step } => step.saturating_mul(attempt as u32),
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl((attempt - 1) as u32).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }

    /// Sum of all sleeps when every attempt fails.
    pub fn worst_case_wait(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|attempt| self.delay_for_attempt(attempt))
            .sum()
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: usize,
        #[source]
        last: E,
    },
    #[error("{operation} failed: {source}")]
    Fatal {
        operation: &'static str,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal { source, .. } => source,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

/// Runs `op` until it succeeds, returns a non-retryable error, or the policy's attempt
/// budget is spent. `op` receives the 1-based attempt number.
pub async fn execute_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.disposition() == RetryDisposition::NonRetryable => {
                return Err(RetryError::Fatal {
                    operation,
                    source: err,
                });
            }
            Err(err) if attempt >= max_attempts => {
                warn!(operation, attempts = attempt, error = %err, "retry budget exhausted");
                return Err(RetryError::Exhausted {
                    operation,
                    attempts: attempt,
                    last: err,
                });
            }
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    error = %err,
                    "attempt failed; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Error)]
    enum FakeError {
        #[error("connection refused")]
        Down,
        #[error("bad request")]
        Bad,
    }

    impl Retryable for FakeError {
        fn disposition(&self) -> RetryDisposition {
            match self {
                FakeError::Down => RetryDisposition::Retryable,
                FakeError::Bad => RetryDisposition::NonRetryable,
            }
        }
    }

    #[test]
    fn linear_backoff_grows_by_a_fixed_step() {
        let policy = RetryPolicy::batch();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(15));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(30));
        assert_eq!(policy.worst_case_wait(), Duration::from_secs(45));
        assert_eq!(RetryPolicy::connection().worst_case_wait(), Duration::from_secs(30));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(100),
                max: Duration::from_millis(350),
            },
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let calls_ref = &calls;
        let result = execute_with_retry(&RetryPolicy::connection(), "connect", move |_| async move {
            if calls_ref.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(FakeError::Down)
            } else {
                Ok("connected")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_outage_waits_a_bounded_time() {
        let policy = RetryPolicy::batch();
        let started = tokio::time::Instant::now();
        let result: Result<(), _> =
            execute_with_retry(&policy, "upsert batch", |_| async { Err(FakeError::Down) }).await;
        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        let waited = started.elapsed();
        assert!(waited >= policy.worst_case_wait());
        assert!(waited < policy.worst_case_wait() + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_stop_immediately() {
        let calls = AtomicUsize::new(0);
        let calls_ref = &calls;
        let result: Result<(), _> = execute_with_retry(&RetryPolicy::http(), "fetch", move |_| async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            Err(FakeError::Bad)
        })
        .await;
        assert!(matches!(result, Err(RetryError::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
