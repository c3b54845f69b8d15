//! # Retry
//!
//! Module providing a `RetryPolicy` struct and the `with_retry` combinator that drives every
//! bounded retry loop in the harness.
use std::fmt;
use std::future::Future;
use std::time;

use tracing::warn;

#[derive(Clone, Debug)]
/// A retry policy to determine how many times an operation runs and how long to wait in between.
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Never less than 1.
    pub max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The interval to wait after the first failed attempt.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(max_attempts: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(max_attempts, initial_interval)
    }

    /// A policy that waits the same `interval` between each of `max_attempts` attempts.
    pub fn fixed(max_attempts: u32, interval: time::Duration) -> Self {
        RetryPolicy::build(max_attempts, interval).provide()
    }

    /// Determine the interval to wait after a given (1-based) failed attempt.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate_interval =
            self.initial_interval * self.backoff_coefficient.pow(attempt.saturating_sub(1));

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Worst case time spent sleeping if every attempt fails.
    pub fn total_delay(&self) -> time::Duration {
        (1..self.max_attempts).map(|a| self.retry_interval(a)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub max_attempts: u32,
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_coefficient: 1,
            initial_interval: time::Duration::from_secs(5),
            maximum_interval: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(max_attempts: u32, initial_interval: time::Duration) -> Self {
        Self {
            max_attempts,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn backoff_coefficient(mut self, coefficient: u32) -> RetryPolicyBuilder {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}

/// How a single attempt failed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The attempt may succeed if run again.
    Transient(E),
    /// Retrying cannot help; `with_retry` returns this error immediately.
    Fatal(E),
}

/// Result of running an operation under a `RetryPolicy` without hitting a fatal error.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success { value: T, attempts: u32 },
    Exhausted { attempts: u32, last_error: E },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. } | RetryOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// Collapse into a `Result`, mapping exhaustion through `on_exhausted`.
    pub fn into_result<F, X>(self, on_exhausted: F) -> Result<T, X>
    where
        F: FnOnce(u32, E) -> X,
    {
        match self {
            RetryOutcome::Success { value, .. } => Ok(value),
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => Err(on_exhausted(attempts, last_error)),
        }
    }
}

/// Run `operation` until it succeeds, fails fatally, or `policy.max_attempts` is reached.
///
/// The operation receives the 1-based attempt number. Each attempt starts from scratch: nothing
/// is carried over from a failed attempt except what the closure captures itself.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<RetryOutcome<T, E>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RetryError<E>>>,
    E: fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                return Ok(RetryOutcome::Success {
                    value,
                    attempts: attempt,
                })
            }
            Err(RetryError::Fatal(error)) => return Err(error),
            Err(RetryError::Transient(error)) => {
                if attempt >= max_attempts {
                    return Ok(RetryOutcome::Exhausted {
                        attempts: attempt,
                        last_error: error,
                    });
                }

                let interval = policy.retry_interval(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    "attempt failed, retrying in {:?}: {}",
                    interval,
                    error
                );
                tokio::time::sleep(interval).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy::fixed(3, time::Duration::from_secs(2));
        let first_interval = retry_policy.retry_interval(1);
        let second_interval = retry_policy.retry_interval(2);
        let third_interval = retry_policy.retry_interval(3);

        assert_eq!(first_interval, time::Duration::from_secs(2));
        assert_eq!(second_interval, time::Duration::from_secs(2));
        assert_eq!(third_interval, time::Duration::from_secs(2));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(5, time::Duration::from_secs(2))
            .backoff_coefficient(2)
            .maximum_interval(time::Duration::from_secs(4))
            .provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(4), time::Duration::from_secs(4));
    }

    #[test]
    fn test_retry_interval_increases_with_coefficient() {
        let retry_policy = RetryPolicy::build(5, time::Duration::from_secs(2))
            .backoff_coefficient(2)
            .provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(8));
    }

    #[test]
    fn test_total_delay_of_shard_validation_policy() {
        // 10 attempts with a fixed 5 second delay sleep 9 times.
        let retry_policy = RetryPolicy::fixed(10, time::Duration::from_secs(5));

        assert_eq!(retry_policy.total_delay(), time::Duration::from_secs(45));
    }

    #[test]
    fn test_zero_attempts_is_clamped_to_one() {
        let retry_policy = RetryPolicy::fixed(0, time::Duration::ZERO);

        assert_eq!(retry_policy.max_attempts, 1);
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let retry_policy = RetryPolicy::fixed(3, time::Duration::ZERO);

        let outcome = with_retry(&retry_policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(RetryError::Transient(format!("attempt {attempt} failed")))
                } else {
                    Ok(attempt * 10)
                }
            }
        })
        .await
        .expect("no fatal error");

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.into_result(|_, e| e).unwrap(), 30);
    }

    #[tokio::test]
    async fn test_with_retry_reports_exhaustion() {
        let retry_policy = RetryPolicy::fixed(4, time::Duration::ZERO);

        let outcome: RetryOutcome<(), String> = with_retry(&retry_policy, |attempt| async move {
            Err(RetryError::Transient(format!("attempt {attempt} failed")))
        })
        .await
        .expect("no fatal error");

        match outcome {
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 4);
                assert_eq!(last_error, "attempt 4 failed");
            }
            RetryOutcome::Success { .. } => panic!("expected exhaustion"),
        }
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_fatal_error() {
        let calls = AtomicU32::new(0);
        let retry_policy = RetryPolicy::fixed(10, time::Duration::ZERO);

        let result: Result<RetryOutcome<(), String>, String> =
            with_retry(&retry_policy, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RetryError::Fatal("corrupt".to_owned())) }
            })
            .await;

        assert_eq!(result.unwrap_err(), "corrupt");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
