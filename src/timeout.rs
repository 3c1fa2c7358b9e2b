//! Timeout and retry utilities for database operations

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::config::ExecutionSettings;
use crate::error::DatabaseError;

/// Calculate retry backoff duration with exponential growth, cap, and jitter
///
/// `backoff = min(base_ms * 2^attempt, max_ms) + random_jitter(0-100ms)`
///
/// With the defaults (base=500ms, max=5000ms):
/// - Attempt 0: 500-600ms
/// - Attempt 1: 1000-1100ms
/// - Attempt 4+: 5000-5100ms (capped)
pub fn calculate_backoff(settings: &ExecutionSettings, attempt: u32) -> Duration {
    let jitter = rand::random::<u64>() % 100;
    let exponential = settings
        .retry_backoff_ms
        .saturating_mul(2_u64.saturating_pow(attempt));
    Duration::from_millis(exponential.min(settings.max_backoff_ms) + jitter)
}

/// Run a read-only operation with timeout protection and automatic retry
///
/// Each attempt is bounded by `timeout_duration`. Transient connectivity
/// errors and timeouts are retried up to `settings.max_retries` times with
/// [`calculate_backoff`] between attempts; any other error is returned as is.
///
/// Only use this for idempotent work such as catalog queries.
pub async fn execute_with_retry<T, F, Fut>(
    settings: &ExecutionSettings,
    timeout_duration: Duration,
    operation_description: &str,
    op: F,
) -> Result<T, DatabaseError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, DatabaseError>>,
{
    let max_retries = settings.max_retries;

    for attempt in 0..=max_retries {
        let last_attempt = attempt == max_retries;
        match timeout(timeout_duration, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) if err.is_transient() && !last_attempt => {
                log::warn!(
                    "{}: connection error on attempt {}/{}: {}. Retrying...",
                    operation_description,
                    attempt + 1,
                    max_retries + 1,
                    err
                );
            }
            Ok(Err(err)) => return Err(err),
            Err(_elapsed) if !last_attempt => {
                log::warn!(
                    "{}: timed out on attempt {}/{}. Retrying...",
                    operation_description,
                    attempt + 1,
                    max_retries + 1
                );
            }
            Err(_elapsed) => {
                return Err(DatabaseError::QueryError(format!(
                    "{} timed out after {:?}",
                    operation_description, timeout_duration
                )));
            }
        }
        tokio::time::sleep(calculate_backoff(settings, attempt)).await;
    }

    Err(DatabaseError::QueryError(format!(
        "{}: max retries ({}) exceeded",
        operation_description, max_retries
    )))
}
