use std::future::Future;
use std::time::Duration;

use crate::api::StoreError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Re-issue an idempotent store call while it fails transiently,
/// doubling the backoff between attempts. Non-transient errors and the
/// final transient one surface unchanged.
pub async fn with_retries<T, F, Fut>(
    context: &str,
    max_attempts: u32,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                tracing::warn!(
                    context,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "transient store failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retries("put_chunks", 5, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Transient {
                        reason: "throttled".into(),
                    })
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries("get", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(StoreError::Transient {
                    reason: "503".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Transient { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries("put_node", 5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Status { code: 403 }) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Status { code: 403 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
