//! Timeout wrapper for async operations.

use std::future::Future;
use std::time::Duration;
use vigil_core::{VigilError, VigilResult};

/// Runs `f`, failing with [`VigilError::Timeout`] after `duration`.
pub async fn with_timeout<F, Fut, T>(operation: &str, duration: Duration, f: F) -> VigilResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = VigilResult<T>>,
{
    tokio::time::timeout(duration, f())
        .await
        .map_err(|_| VigilError::Timeout(format!("{operation} timed out after {duration:?}")))?
}
