use crate::error::{AppError, RetryError};
use std::future::Future;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::warn;

const DEFAULT_INITIAL_DELAY_MS: u64 = 200;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Exponential backoff for store writes. Without `max_elapsed` a failing
/// operation is retried until cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            max_elapsed: None,
        }
    }
}

fn jitter_ms(bound_ms: u64) -> u64 {
    if bound_ms == 0 {
        return 0;
    }
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => u64::from(duration.subsec_nanos()) % bound_ms,
        Err(_) => 0,
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let base_ms = initial_ms.saturating_mul(1_u64 << exponent);
        let delay = Duration::from_millis(base_ms.saturating_add(jitter_ms(initial_ms)));
        delay.min(self.max_delay)
    }
}

pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut attempt_fn: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let error = match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        attempts = attempts.saturating_add(1);

        if policy
            .max_elapsed
            .is_some_and(|limit| started.elapsed() >= limit)
        {
            return Err(RetryError::Exhausted {
                attempts,
                source: error,
            });
        }

        let delay = policy.delay(attempts);
        warn!(
            operation,
            attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            %error,
            "operation failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
pub(crate) fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_elapsed: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            max_elapsed: None,
        };

        let first = policy.delay(1);
        let third = policy.delay(3);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(500));
        assert_eq!(policy.delay(30), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = retry_with_backoff(&fast_policy(), &cancel, "flaky", || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(AppError::InvalidArgument("transient".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .expect("third attempt should succeed");

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), RetryError> =
            retry_with_backoff(&fast_policy(), &cancel, "never", || async { Ok(()) }).await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff_sleep() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            max_elapsed: None,
        };
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: Result<(), RetryError> = retry_with_backoff(&policy, &cancel, "down", || async {
            Err(AppError::InvalidArgument("down".to_string()))
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn gives_up_after_max_elapsed() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_elapsed: Some(Duration::ZERO),
            ..fast_policy()
        };

        let result: Result<(), RetryError> = retry_with_backoff(&policy, &cancel, "down", || async {
            Err(AppError::InvalidArgument("down".to_string()))
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 1, .. })
        ));
    }
}
