//! Work queue error types.

use thiserror::Error;
use vigil_core::VigilError;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Work queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The topic's stream has not been provisioned yet.
    #[error("stream not provisioned for topic {0}")]
    StreamNotProvisioned(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Returns true if the operation may succeed when tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Redis(_) | QueueError::Pool(_))
    }

    /// Returns true if provisioning the stream topology would fix this error.
    pub fn is_stream_not_provisioned(&self) -> bool {
        matches!(self, QueueError::StreamNotProvisioned(_))
    }
}

impl From<QueueError> for VigilError {
    fn from(err: QueueError) -> Self {
        VigilError::Queue(err.to_string())
    }
}
