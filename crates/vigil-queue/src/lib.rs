//! # Vigil Queue
//!
//! Durable work queue between the scheduler and the remote workers.
//!
//! - Redis Streams backend: one stream per topic, consumer groups,
//!   explicit acknowledgment and redelivery after an ack-wait window
//! - Producer-assigned dedup keys checked atomically with the append
//! - Lazy stream provisioning
//! - Wire envelopes for describe jobs and compliance runners
//! - In-memory backend with the same semantics for tests
//!
//! ```text
//!   scheduler ──publish──▶ {prefix}:stream:describe-jobs ──▶ workers
//!                                                              │
//!   consumers ◀──fetch/ack── {prefix}:stream:describe-results ◀┘
//! ```

pub mod consumer;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod redis;

pub use consumer::{Consumer, Disposition, Heartbeat, MessageHandler};
pub use error::{QueueError, QueueResult};
pub use memory::InMemoryQueue;
pub use metrics::{register_metrics, QueueMetrics};
pub use protocol::{
    dedup, topics, ConsumerSpec, DescribeJobMessage, DescribeResultMessage, ExecutionPlan,
    FindingStatus, RunnerFinding, RunnerJobMessage, RunnerResultMessage, StreamSpec,
};
pub use queue::{decode, provision_all, publish_json, publish_provisioned, Delivery, PublishAck, WorkQueue};
pub use self::redis::{create_pool, RedisKeys, RedisStreamQueue, RedisStreamQueueParameters};
