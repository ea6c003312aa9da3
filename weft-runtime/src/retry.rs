//! Retry policy for transient failures
//!
//! Exponential backoff with full jitter: `delay = random(0, min(cap,
//! base * multiplier^attempt))`, which spreads concurrent retries instead of
//! synchronizing them. Used for agent submissions and transfer attempts;
//! task-level retries are driven by the scheduler's attempt counter.

use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use weft_core::Result;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    None,
    Fixed,
    Exponential,
    ExponentialWithJitter,
}

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Base delay for the first retry
    pub initial_delay: Duration,
    /// Cap on exponential growth
    pub max_delay: Duration,
    /// Ceiling on total time spent retrying
    pub max_elapsed: Duration,
    pub strategy: RetryStrategy,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(120),
            strategy: RetryStrategy::ExponentialWithJitter,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.strategy {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Fixed => self.initial_delay,
            RetryStrategy::Exponential => self.exponential_delay(attempt),
            RetryStrategy::ExponentialWithJitter => {
                let cap = self.exponential_delay(attempt);
                if cap.is_zero() {
                    Duration::ZERO
                } else {
                    let max_ms = cap.as_millis() as u64;
                    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
                }
            }
        }
    }

    fn exponential_delay(&self, attempt: u32) -> Duration {
        let delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run an operation, retrying retriable errors with backoff until the
    /// attempt budget or the elapsed ceiling runs out.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    attempt += 1;
                    if !error.is_retriable() {
                        tracing::debug!(%error, "Non-retriable error, failing immediately");
                        return Err(error);
                    }
                    if attempt >= self.max_attempts {
                        tracing::debug!(attempt, max_attempts = self.max_attempts, "Attempt budget exhausted");
                        return Err(error);
                    }
                    if start.elapsed() >= self.max_elapsed {
                        tracing::debug!(
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Retry elapsed ceiling exceeded"
                        );
                        return Err(error);
                    }
                    let delay = self.delay_for(attempt - 1);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, %error, "Retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use weft_core::Error;

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_stays_under_cap() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        for attempt in 0..5 {
            assert!(policy.delay_for(attempt) <= policy.exponential_delay(attempt));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let calls = AtomicU32::new(0);
        let result: Result<u32> = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::Transfer("flaky link".into()))
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
    async fn test_non_retriable_fails_fast() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Submission("bad".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_budget_is_respected() {
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Transfer("down".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
