//! Write-conflict retry logic
//!
//! An association session that loses an optimistic commit race is re-run
//! from scratch (fresh snapshot, fresh cone search) with exponential backoff.

use skycat_common::Result;
use std::time::{Duration, Instant};

/// Initial backoff delay
const INITIAL_BACKOFF_MS: u64 = 10;
/// Backoff ceiling
const MAX_BACKOFF_MS: u64 = 1000;

/// Final result of a retried operation and the number of attempts it took
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Retry an operation on `WriteConflict` with exponential backoff.
///
/// **Algorithm:**
/// 1. Attempt operation (the closure receives the 1-based attempt number)
/// 2. If successful, return result
/// 3. If the error is retryable and fewer than `max_retries` retries were
///    made: log WARN, back off, retry
/// 4. Otherwise return the error
///
/// **Backoff Strategy:** 10ms initial, doubling, capped at 1000ms.
pub async fn retry_on_conflict<F, Fut, T>(
    operation_name: &str,
    max_retries: u32,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    let mut attempt = 0u32;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis(),
                        "Operation succeeded after write-conflict retry"
                    );
                }
                return RetryOutcome {
                    result: Ok(result),
                    attempts: attempt,
                };
            }
            Err(err) if err.is_retryable() && attempt <= max_retries => {
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms,
                    error = %err,
                    "Write conflict, will retry after backoff"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis(),
                        "Write conflict retries exhausted"
                    );
                }
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skycat_common::Error;

    #[tokio::test]
    async fn test_succeeds_first_attempt() {
        let outcome = retry_on_conflict("test_op", 3, |_| async { Ok::<i32, Error>(42) }).await;
        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_conflicts() {
        let outcome = retry_on_conflict("test_op", 3, |attempt| async move {
            if attempt < 3 {
                Err(Error::WriteConflict("row changed".to_string()))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), 3);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let outcome = retry_on_conflict("test_op", 2, |_| async {
            Err::<i32, Error>(Error::WriteConflict("always".to_string()))
        })
        .await;

        let err = outcome.result.unwrap_err();
        assert_eq!(err.reason_code(), "WRITE_CONFLICT");
        // One initial attempt plus two retries
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_non_conflict_error_fails_immediately() {
        let mut calls = 0;
        let outcome = retry_on_conflict("test_op", 5, |_| {
            calls += 1;
            async { Err::<i32, Error>(Error::StoreUnavailable("down".to_string())) }
        })
        .await;

        assert_eq!(outcome.result.unwrap_err().reason_code(), "STORE_UNAVAILABLE");
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls, 1);
    }
}
