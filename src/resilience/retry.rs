use std::future::Future;
use std::time::Duration;

use crate::error::PulseError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Sleep after the `attempt`-th failure (1-based): `backoff_base * 2^attempt`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Run `op` up to `policy.retries` times, sleeping with exponential backoff
/// between attempts.
///
/// Only retryable errors are retried; anything else is returned as-is on the
/// attempt that produced it. When every attempt fails the last error is
/// wrapped in `RetryExhausted`.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, PulseError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PulseError>>,
{
    let attempts = policy.retries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= attempts {
            log::warn!("{}: giving up after {} attempts: {}", label, attempts, err);
            return Err(PulseError::RetryExhausted {
                attempts,
                last: Box::new(err),
            });
        }

        let delay = policy.delay_after(attempt);
        log::warn!(
            "{}: retry {}/{} after error: {} (sleep {:?})",
            label,
            attempt,
            attempts,
            err,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_two_failures() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = retry_with_backoff(&RetryPolicy::default(), "test", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= 2 {
                Err(PulseError::TransientDownstream(format!("failure {}", n)))
            } else {
                Ok("done")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_surfaces_last_error_when_exhausted() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(&RetryPolicy::default(), "test", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err::<(), _>(PulseError::TransientDownstream(format!("failure {}", n)))
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            PulseError::RetryExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last.to_string(), "Transient downstream error: failure 3");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(&RetryPolicy::default(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(PulseError::PermanentDownstream("schema".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.outcome_label(), "permanent_downstream");
    }
}
