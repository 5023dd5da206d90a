// src/utils/retry.rs

//! Bounded exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;
use crate::models::CrawlerConfig;

/// Retry schedule: `base * 2^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// Only errors with [`AppError::is_transient`](crate::error::AppError::is_transient)
/// are retried. Returns the final result and the number of attempts made.
pub async fn retry_transient<T, F, Fut>(backoff: Backoff, mut op: F) -> (Result<T>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return (Ok(value), attempt),
            Err(err) if err.is_transient() && attempt < backoff.max_attempts => {
                let delay = backoff.delay_after(attempt);
                log::debug!("Attempt {} failed ({}), retrying in {:?}", attempt, err, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return (Err(err), attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> Backoff {
        Backoff::new(max_attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let backoff = Backoff::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.delay_after(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_after(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_after(3), Duration::from_millis(350));
        assert_eq!(backoff.delay_after(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = retry_transient(fast(3), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(AppError::transient("npm", "timeout"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_permanent_is_not_retried() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = retry_transient(fast(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(AppError::permanent("npm", "404")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (result, attempts) = retry_transient(fast(3), |_| async {
            Err::<(), _>(AppError::transient("pypi", "503"))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(attempts, 3);
    }
}
