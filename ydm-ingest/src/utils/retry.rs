//! Retry with exponential backoff
//!
//! Two flavours:
//! - [`retry_on_lock`]: time-bounded retry of SQLite writes that hit
//!   "database is locked"; any other error fails immediately.
//! - [`retry_with_backoff`]: attempt-bounded retry for network fetches and
//!   gateway writes, with a caller-supplied retryability test.

use std::time::{Duration, Instant};
use ydm_common::{Error, Result};

const LOCK_INITIAL_BACKOFF_MS: u64 = 10;
const LOCK_MAX_BACKOFF_MS: u64 = 1000;

/// Attempt budget and backoff curve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Single attempt, no retry
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay before attempt `attempt + 1` (1-based `attempt`)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Error returned once the attempt budget is spent
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` is reached.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    operation_name: &str,
    policy: RetryPolicy,
    is_retryable: P,
    mut operation: F,
) -> std::result::Result<T, RetryExhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !is_retryable(&err) || attempt >= policy.max_attempts {
                    if attempt > 1 {
                        tracing::warn!(
                            operation = operation_name,
                            attempt,
                            error = %err,
                            "Giving up after retries"
                        );
                    }
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }

                let backoff = policy.backoff_after(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Attempt failed, will retry after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// True for SQLite lock contention
pub fn is_lock_error(err: &Error) -> bool {
    match err {
        Error::Database(db_err) => db_err.to_string().contains("database is locked"),
        _ => false,
    }
}

/// Retry a database operation while it reports lock contention, for at most
/// `max_wait_ms`. Backoff starts at 10ms and doubles up to 1s.
pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt = 0;
    let mut backoff_ms = LOCK_INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    let elapsed_ms = start_time.elapsed().as_millis() as u64;
                    if elapsed_ms > 2000 {
                        tracing::warn!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms,
                            "Database operation succeeded after significant retry period (>2s)"
                        );
                    } else {
                        tracing::debug!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms,
                            "Database operation succeeded after retry"
                        );
                    }
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_lock_error(&err) {
                    return Err(err);
                }

                let elapsed = start_time.elapsed();
                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        max_wait_ms,
                        "Database operation failed: max retry time exceeded"
                    );
                    return Err(Error::Internal(format!(
                        "Database locked after {} attempts ({} ms elapsed, max {} ms)",
                        attempt,
                        elapsed.as_millis(),
                        max_wait_ms
                    )));
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    backoff_ms,
                    "Database locked, will retry after backoff"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(LOCK_MAX_BACKOFF_MS);
            }
        }
    }
}
