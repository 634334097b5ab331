//! Retry with bounded exponential backoff and jitter.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, warn};

use crate::error::{panic_message, Error, Result};

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, before jitter.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
    /// Overall budget. No new attempt starts once it is exceeded.
    pub timeout_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            timeout_ms: None,
        }
    }
}

/// Runs fallible async operations until they succeed, fail permanently,
/// or the attempt/time budget runs out.
#[derive(Debug, Clone, Default)]
pub struct RetryStrategy {
    config: RetryConfig,
}

impl RetryStrategy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// A strategy that makes a single attempt.
    pub fn none() -> Self {
        Self::new(RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// The delay after failed attempt `retry` (0-based), before jitter:
    /// `min(initial_delay * backoff_factor ^ retry, max_delay)`.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let delay_ms =
            self.config.initial_delay_ms as f64 * self.config.backoff_factor.powi(exponent);
        let capped = delay_ms.min(self.config.max_delay_ms as f64);
        Duration::from_micros((capped.max(0.0) * 1000.0).round() as u64)
    }

    /// The base delay scaled by a random factor in `[0.5, 1.0]`.
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let factor = rand::rng().random_range(0.5..=1.0);
        self.base_delay(retry).mul_f64(factor)
    }

    /// Executes `operation` with retries.
    ///
    /// Stops and returns the last failure when the attempts are exhausted,
    /// when the overall timeout has elapsed, or when the failure is not
    /// retryable. A panic inside the operation is caught and turned into a
    /// retryable [`Error::Infrastructure`] carrying the attempt number.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let timeout = self.config.timeout_ms.map(Duration::from_millis);
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = AssertUnwindSafe(async { operation().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(Error::Infrastructure {
                        message: panic_message(payload.as_ref()),
                        retryable: true,
                        attempts: Some(attempt),
                    })
                });

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }

            if attempt >= max_attempts {
                error!(attempts = attempt, kind = err.kind(), error = %err, "Retries exhausted");
                return Err(err);
            }

            if budget_spent(started, timeout) {
                error!(attempts = attempt, ?timeout, error = %err, "Retry budget exceeded");
                return Err(err);
            }

            let delay = self.jittered_delay(attempt - 1);
            warn!(attempt, ?delay, kind = err.kind(), error = %err, "Attempt failed, retrying");
            tokio::time::sleep(delay).await;

            // The wait itself may have used up the budget.
            if budget_spent(started, timeout) {
                error!(attempts = attempt, ?timeout, error = %err, "Retry budget exceeded");
                return Err(err);
            }
        }
    }
}

fn budget_spent(started: Instant, timeout: Option<Duration>) -> bool {
    timeout.is_some_and(|timeout| started.elapsed() >= timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn strategy(max_attempts: u32) -> RetryStrategy {
        RetryStrategy::new(RetryConfig {
            max_attempts,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_factor: 2.0,
            timeout_ms: None,
        })
    }

    #[test]
    fn base_delay_grows_exponentially_up_to_the_cap() {
        let strategy = strategy(10);

        assert_eq!(strategy.base_delay(0), Duration::from_millis(100));
        assert_eq!(strategy.base_delay(1), Duration::from_millis(200));
        assert_eq!(strategy.base_delay(3), Duration::from_millis(800));
        assert_eq!(strategy.base_delay(4), Duration::from_millis(1_000));
        assert_eq!(strategy.base_delay(30), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_between_half_and_full_delay() {
        let strategy = strategy(10);

        for _ in 0..200 {
            let delay = strategy.jittered_delay(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_are_attempted_max_attempts_times() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = strategy(3)
            .execute(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(Error::infrastructure(format!("attempt {n} failed")))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result, Err(Error::infrastructure("attempt 3 failed")));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failures_are_attempted_once() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = strategy(3)
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::validation("missing event type"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);

        let result = strategy(5)
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::infrastructure("connection reset"))
                } else {
                    Ok("published")
                }
            })
            .await;

        assert_eq!(result, Ok("published"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn panics_become_retryable_infrastructure_failures() {
        let calls = AtomicU32::new(0);

        async fn explode() -> Result<()> {
            panic!("broker client exploded")
        }

        let result = strategy(2)
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                explode()
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            result,
            Err(Error::Infrastructure {
                message: "broker client exploded".into(),
                retryable: true,
                attempts: Some(2),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stops_once_the_timeout_has_elapsed() {
        let started = Instant::now();
        let attempt_starts = std::sync::Mutex::new(Vec::new());
        let strategy = RetryStrategy::new(RetryConfig {
            max_attempts: 100,
            initial_delay_ms: 1_000,
            max_delay_ms: 1_000,
            backoff_factor: 1.0,
            timeout_ms: Some(2_500),
        });

        let result: Result<()> = strategy
            .execute(|| async {
                attempt_starts.lock().unwrap().push(started.elapsed());
                tokio::time::sleep(Duration::from_millis(1_000)).await;
                Err(Error::infrastructure("slow dependency"))
            })
            .await;

        assert!(result.is_err());
        // Each attempt takes 1s plus a jittered wait of 0.5s to 1s.
        let attempt_starts = attempt_starts.into_inner().unwrap();
        assert!((1..=2).contains(&attempt_starts.len()), "made {} attempts", attempt_starts.len());
        assert!(attempt_starts
            .iter()
            .all(|at| *at < Duration::from_millis(2_500)));
    }

    #[tokio::test(start_paused = true)]
    async fn no_attempt_starts_after_a_wait_that_outlives_the_timeout() {
        let calls = AtomicU32::new(0);
        let strategy = RetryStrategy::new(RetryConfig {
            max_attempts: 10,
            initial_delay_ms: 1_000,
            max_delay_ms: 1_000,
            backoff_factor: 1.0,
            timeout_ms: Some(1_200),
        });

        let result: Result<()> = strategy
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1_000)).await;
                Err(Error::infrastructure("slow dependency"))
            })
            .await;

        assert_eq!(result, Err(Error::infrastructure("slow dependency")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
