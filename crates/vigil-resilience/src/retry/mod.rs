//! Retry with exponential backoff.

use backoff::{future::retry, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use vigil_core::VigilError;

/// Retry policy for idempotent calls to external collaborators.
///
/// Only errors classified as transient by [`VigilError::is_retriable`] are
/// retried; anything else is returned after the first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound of a single delay.
    pub max_delay: Duration,
    /// Growth factor between delays.
    pub multiplier: f64,
    /// Relative jitter applied to every delay, 0.0 disables it.
    pub randomization: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            randomization: 0.25,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Single attempt, no retry.
    #[must_use]
    pub fn none() -> Self {
        Self::with_max_attempts(1)
    }

    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.randomization = 0.0;
        self
    }

    /// Runs `f` until it succeeds, fails permanently, or attempts run out.
    pub async fn execute<F, Fut, T>(&self, mut f: F) -> Result<T, VigilError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VigilError>>,
    {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization)
            .with_max_elapsed_time(None)
            .build();

        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;

        retry(backoff, || {
            attempt += 1;
            let current = attempt;
            let fut = f();
            async move {
                fut.await.map_err(|e| {
                    if e.is_retriable() && current < max_attempts {
                        debug!(attempt = current, error = %e, "Attempt failed, retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Default::default()
        }
        .without_jitter()
    }

    #[tokio::test]
    async fn test_retry_eventual_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = fast(3)
            .execute(|| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(VigilError::external("integration", "503"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_at_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<(), _> = fast(3)
            .execute(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(VigilError::Timeout("slow".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(VigilError::Timeout(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<(), _> = fast(5)
            .execute(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(VigilError::not_found("Connection", "c-1"))
                }
            })
            .await;

        assert!(matches!(result, Err(VigilError::NotFound { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_none_makes_single_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let _ = RetryPolicy::none()
            .execute(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(VigilError::Queue("down".into()))
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
