//! Redis Streams work queue backend.

mod queue;

pub use queue::{RedisStreamQueue, RedisStreamQueueParameters};

use crate::error::{QueueError, QueueResult};
use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;
use vigil_config::RedisConfig;

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisConfig) -> QueueResult<Pool> {
    info!("Creating Redis connection pool for work queue...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| QueueError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size as usize)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| QueueError::Configuration(format!("Failed to create pool: {}", e)))?;

    // Test connection
    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder for the work queue.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Stream holding a topic's messages.
    pub fn stream(&self, topic: &str) -> String {
        format!("{}:stream:{}", self.prefix, topic)
    }

    /// Provisioning marker of a topic (hash: stream, max_len).
    pub fn topic(&self, topic: &str) -> String {
        format!("{}:topic:{}", self.prefix, topic)
    }

    /// Per-topic sequence counter.
    pub fn seq(&self, topic: &str) -> String {
        format!("{}:seq:{}", self.prefix, topic)
    }

    /// Dedup window entry (value: sequence number of the first publish).
    pub fn dedup(&self, topic: &str, key: &str) -> String {
        format!("{}:dedup:{}:{}", self.prefix, topic, key)
    }

    /// Scheduler leader lock.
    pub fn scheduler_lock(&self) -> String {
        format!("{}:scheduler:lock", self.prefix)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("vigil:queue")
    }
}
