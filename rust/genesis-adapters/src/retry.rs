//! Bounded retry with exponential backoff for adapter calls

use std::future::Future;
use std::time::Duration;

use genesis_types::{ControlError, ControlResult};
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 15_000,
        }
    }
}

/// Run `op` up to `max_attempts` times. Non-retryable errors pass through
/// immediately; a retryable error's own `retry_after_ms` (429 Retry-After)
/// overrides the computed backoff when longer.
pub async fn with_retry<F, Fut, T>(
    policy: RetryPolicy,
    op_name: &str,
    mut op: F,
) -> ControlResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlResult<T>>,
{
    let mut delay_ms = policy.base_delay_ms;
    let mut last_err: Option<ControlError> = None;

    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() || attempt == policy.max_attempts {
                    return Err(err);
                }
                let wait = delay_ms.max(err.retry_after_ms().unwrap_or(0));
                debug!(
                    op = op_name,
                    attempt,
                    wait_ms = wait,
                    code = err.code(),
                    "retrying after transient failure"
                );
                last_err = Some(err);
                sleep(Duration::from_millis(wait)).await;
                delay_ms = (delay_ms.saturating_mul(2)).min(policy.max_delay_ms);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| ControlError::Timeout(format!("{} retry loop", op_name))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };
        let result = with_retry(policy, "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ControlError::Timeout("slow".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_pass_through_without_retry() {
        let calls = AtomicU32::new(0);
        let result: ControlResult<()> =
            with_retry(RetryPolicy::default(), "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ControlError::ValidationFailed("bad".into()))
            })
            .await;
        assert!(!result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
