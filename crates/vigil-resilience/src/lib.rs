//! # Vigil Resilience
//!
//! Resilience patterns for the scheduler's calls to external collaborators.
//! Provides token-bucket rate limiting, retry with exponential backoff, and
//! timeouts.

pub mod rate_limiter;
pub mod retry;
pub mod timeout;

pub use rate_limiter::*;
pub use retry::*;
pub use timeout::*;
