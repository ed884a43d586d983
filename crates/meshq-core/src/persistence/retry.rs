use std::future::Future;
use std::time::Duration;

use crate::models::{CoreError, CoreErrorKind};
use crate::persistence::PersistenceResult;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Only storage failures are retried.
    pub fn is_transient(error: &CoreError) -> bool {
        error.kind == CoreErrorKind::StorageFailure
    }
}

pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> PersistenceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PersistenceResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if !RetryPolicy::is_transient(&error) => return Err(error),
            Err(error) if attempt >= max_attempts => {
                tracing::error!(
                    operation = operation_name,
                    attempts = max_attempts,
                    message = %error.message,
                    "persistence operation exhausted retries"
                );
                return Err(CoreError {
                    message: format!(
                        "failed to complete '{operation_name}' after {max_attempts} attempts: {}",
                        error.message
                    ),
                    ..error
                });
            }
            Err(error) => {
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    message = %error.message,
                    "persistence operation failed; retrying"
                );
                tokio::time::sleep(policy.backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn storage_failures_are_retried_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = with_retry(fast_policy(5), "flaky", || {
            let attempts = attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CoreError::new(CoreErrorKind::StorageFailure, "database is locked"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_fails_without_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let error = with_retry(fast_policy(5), "lookup", || {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CoreError::not_found("project 4 not found"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(error.kind, CoreErrorKind::NotFound);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_name_the_operation() {
        let attempts = Arc::new(AtomicU32::new(0));
        let error = with_retry(fast_policy(3), "update_task_status", || {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CoreError::new(CoreErrorKind::StorageFailure, "disk I/O error"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(error.kind, CoreErrorKind::StorageFailure);
        assert!(error.message.contains("update_task_status"));
        assert!(error.message.contains("disk I/O error"));
    }
}
