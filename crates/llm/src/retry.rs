//! Retry/backoff policy for `LLMService::send` and stream establishment
//! (§4.5). Never applied mid-stream — once a stream is established, errors
//! surface directly to the chunk consumer.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::LlmError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_secs(1), max_delay: Duration::from_secs(30) }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the attempt numbered `attempt` (1-based)
    /// failed: `base * 2^(attempt-1)`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let millis = u64::try_from(self.base_delay.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Runs `attempt` up to `policy.max_attempts` times, honoring
/// `cancel` between waits and on entry (§5: "context cancellation ...
/// during backoff returns immediately with Cancelled"). A retryable error
/// that survives every attempt is reported as `UpstreamUnavailable`; a
/// non-retryable error is returned immediately, untouched.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, LlmError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    for n in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(_) if n == policy.max_attempts => return Err(LlmError::UpstreamUnavailable),
            Err(_) => {
                let delay = policy.delay_for(n);
                tokio::select! {
                    () = cancel.cancelled() => return Err(LlmError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    unreachable!("loop above always returns by the final attempt")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retries_retryable_errors_up_to_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();

        let calls2 = calls.clone();
        let result: Result<(), LlmError> = retry_with_backoff(&policy, &cancel, move |_| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::Upstream { status: 503, body: String::new() })
            }
        })
        .await;

        assert!(matches!(result, Err(LlmError::UpstreamUnavailable)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();

        let calls2 = calls.clone();
        let result: Result<(), LlmError> = retry_with_backoff(&policy, &cancel, move |_| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::Upstream { status: 404, body: String::new() })
            }
        })
        .await;

        assert!(matches!(result, Err(LlmError::Upstream { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), LlmError> =
            retry_with_backoff(&policy, &cancel, |_| async { Ok(()) }).await;

        assert!(matches!(result, Err(LlmError::Cancelled)));
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
    }
}
