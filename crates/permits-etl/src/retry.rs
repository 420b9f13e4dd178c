//! Bounded retry with exponential backoff, and per-call timeouts

use permits_common::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Default number of attempts per stage, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Initial backoff in milliseconds (doubles each retry).
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;

/// Upper bound for a single backoff in milliseconds.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Default timeout for a single remote store call in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub call_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
        }
    }
}

/// The error that ended a retried operation, with the attempts spent on it
#[derive(Debug)]
pub struct Exhausted {
    pub error: PipelineError,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Delay before retry number `attempt` (1-based): initial * 2^(attempt-1), capped
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is spent.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> std::result::Result<T, Exhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    let backoff = self.backoff_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Retryable failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => {
                    return Err(Exhausted {
                        error,
                        attempts: attempt,
                    })
                }
            }
        }
    }
}

/// Bound a single remote call; an elapsed timeout is a retryable connectivity error
pub async fn with_timeout<T>(
    service: &str,
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::timeout(service, limit)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 250,
            call_timeout_secs: 1,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(250));
        assert_eq!(policy.backoff_for(64), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_connectivity_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = policy()
            .run("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(PipelineError::connectivity("s3", "connection reset"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), _> = policy()
            .run("down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::connectivity("postgres", "refused"))
            })
            .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schema_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), _> = policy()
            .run("mapping", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::schema("ottawa_permits", "mapping conflict"))
            })
            .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let result: Result<()> = with_timeout("search", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_retryable());
    }
}
