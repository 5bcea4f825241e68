use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Retryable;

/// Bounded retry with a constant delay between attempts.
///
/// Holds no state between calls; `execute` may be shared by any number of
/// concurrent callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out.
    ///
    /// The closure receives the 1-based attempt number. Returns the first
    /// success or the last failure.
    pub async fn execute<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt <= self.max_retries => {
                    #[allow(clippy::cast_possible_truncation)]
                    let delay_ms = self.retry_delay.as_millis() as u64;
                    warn!(
                        label,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms,
                        error = %err,
                        "retryable failure, will retry"
                    );
                    if !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!(label, attempt, error = %err, "retries exhausted");
                    } else {
                        debug!(label, attempt, error = %err, "fatal failure, not retrying");
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::error::{FetchError, ParseError, StageError};

    fn network() -> StageError {
        FetchError::Network {
            url: "https://x".into(),
            reason: "reset".into(),
        }
        .into()
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let mut calls = 0;
        let out: Result<u32, StageError> = RetryPolicy::new(3, Duration::ZERO)
            .execute("t", |attempt| {
                calls += 1;
                async move { Ok(attempt) }
            })
            .await;
        assert_eq!(out.unwrap(), 1);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let mut calls = 0;
        let out: Result<&str, StageError> = RetryPolicy::new(3, Duration::ZERO)
            .execute("t", |attempt| {
                calls += 1;
                async move {
                    if attempt < 3 {
                        Err(network())
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), "ok");
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn attempts_bounded_by_max_retries_plus_one() {
        for max_retries in 0..5 {
            let mut calls = 0;
            let out: Result<(), StageError> = RetryPolicy::new(max_retries, Duration::ZERO)
                .execute("t", |_| {
                    calls += 1;
                    async { Err(network()) }
                })
                .await;
            assert!(matches!(out, Err(StageError::Fetch(_))));
            assert_eq!(calls, max_retries + 1);
        }
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let mut calls = 0;
        let out: Result<(), StageError> = RetryPolicy::new(5, Duration::ZERO)
            .execute("t", |_| {
                calls += 1;
                async { Err(ParseError::MalformedInput("bad".into()).into()) }
            })
            .await;
        assert!(matches!(out, Err(StageError::Parse(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn returns_last_failure() {
        let out: Result<(), StageError> = RetryPolicy::new(2, Duration::ZERO)
            .execute("t", |attempt| async move {
                Err(FetchError::Network {
                    url: "u".into(),
                    reason: format!("attempt {attempt}"),
                }
                .into())
            })
            .await;
        assert_eq!(out.unwrap_err().to_string(), "network error fetching u: attempt 3");
    }

    #[tokio::test]
    async fn waits_constant_delay_between_attempts() {
        let delay = Duration::from_millis(20);
        let start = Instant::now();
        let _: Result<(), StageError> = RetryPolicy::new(2, delay)
            .execute("t", |_| async { Err(network()) })
            .await;
        assert!(start.elapsed() >= delay * 2);
    }
}
