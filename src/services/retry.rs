//! Bounded retry with exponential backoff around chunk transmission.

use crate::errors::{UploadError, UploadResult};
use std::{future::Future, time::Duration};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): `base × 2^(attempt-1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> UploadResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = UploadResult<T>>,
    {
        self.run_observed(label, op, |_| {}).await
    }

    /// Like [`RetryPolicy::run`], calling `on_retry` with the failed attempt
    /// number before each backoff sleep.
    pub async fn run_observed<T, F, Fut, H>(
        &self,
        label: &str,
        mut op: F,
        mut on_retry: H,
    ) -> UploadResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = UploadResult<T>>,
        H: FnMut(u32),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        label, attempt, max_attempts, err, delay
                    );
                    on_retry(attempt);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!("{} failed after {} attempts: {}", label, attempt, err);
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Bound one attempt; an elapsed timer counts as a transient failure.
pub async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = UploadResult<T>>,
) -> UploadResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(UploadError::TransientTransport(format!(
            "no response within {:?}",
            timeout
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let result = instant()
            .run("chunk", |_| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(UploadError::TransientTransport("timeout".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_bound() {
        let calls = AtomicU32::new(0);
        let result: UploadResult<()> = instant()
            .run("chunk", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(UploadError::TransientTransport("reset".into()))
            })
            .await;
        assert!(matches!(result, Err(UploadError::TransientTransport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_skip_the_budget() {
        let calls = AtomicU32::new(0);
        let result: UploadResult<()> = instant()
            .run("chunk", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(UploadError::Protocol {
                    status: 400,
                    body: "bad".into(),
                })
            })
            .await;
        assert!(matches!(result, Err(UploadError::Protocol { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
