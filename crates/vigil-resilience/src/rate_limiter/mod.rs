//! Token-bucket rate limiter.

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use vigil_core::{VigilError, VigilResult};

type DirectLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Shared token bucket. Clones draw from the same bucket.
#[derive(Clone)]
pub struct RateLimiter {
    limiter: Arc<DirectLimiter>,
    per_second: u32,
}

impl RateLimiter {
    /// Creates a limiter allowing `requests_per_second`, with a burst of the same size.
    /// Zero is treated as one.
    #[must_use]
    pub fn per_second(requests_per_second: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: Arc::new(GovernorRateLimiter::direct(Quota::per_second(rate))),
            per_second: rate.get(),
        }
    }

    /// Configured rate.
    #[must_use]
    pub const fn rate(&self) -> u32 {
        self.per_second
    }

    /// Takes a token if one is available.
    pub fn check(&self) -> VigilResult<()> {
        self.limiter
            .check()
            .map_err(|_| VigilError::RateLimitExceeded)
    }

    /// Waits for a token.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("per_second", &self.per_second)
            .finish_non_exhaustive()
    }
}
