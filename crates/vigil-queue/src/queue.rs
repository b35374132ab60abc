//! Work queue abstraction.

use crate::error::{QueueError, QueueResult};
use crate::protocol::{ConsumerSpec, StreamSpec};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};
use vigil_core::{Interface, SequenceNumber};

/// Outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    /// Sequence number of the stored message.
    pub seq: SequenceNumber,
    /// The dedup key was seen inside the window; `seq` is the original message's.
    pub duplicate: bool,
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    /// Backend entry identifier used to acknowledge the message.
    pub entry_id: String,
    pub seq: SequenceNumber,
    pub payload: Vec<u8>,
    /// Deliveries so far, this one included.
    pub delivery_count: u32,
}

/// Durable, consumer-grouped message stream.
///
/// Publishing is deduplicated by a producer-assigned key; consumption is
/// at-least-once with explicit acknowledgment and redelivery after the
/// consumer's ack-wait window.
#[async_trait]
pub trait WorkQueue: Interface + Send + Sync {
    /// Creates the stream topology. Idempotent.
    async fn provision(&self, stream: &StreamSpec) -> QueueResult<()>;

    /// Appends a message. Fails with `StreamNotProvisioned` if the topic's
    /// stream does not exist.
    async fn publish(&self, topic: &str, payload: &[u8], dedup_key: &str) -> QueueResult<PublishAck>;

    /// Creates the consumer group if it does not exist.
    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> QueueResult<()>;

    /// Up to `max` messages: expired unacknowledged deliveries first, then new
    /// ones, waiting at most `block` when nothing is available.
    async fn fetch(
        &self,
        spec: &ConsumerSpec,
        max: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>>;

    /// Acknowledges a delivery; it will not be redelivered.
    async fn ack(&self, spec: &ConsumerSpec, delivery: &Delivery) -> QueueResult<()>;

    /// Negative acknowledgment: redeliver now, or drop once `max_deliver` is reached.
    async fn nak(&self, spec: &ConsumerSpec, delivery: &Delivery) -> QueueResult<()>;

    /// Restarts the delivery's ack-wait window.
    async fn in_progress(&self, spec: &ConsumerSpec, delivery: &Delivery) -> QueueResult<()>;

    /// Checks the backend is reachable.
    async fn health_check(&self) -> QueueResult<()>;
}

/// Serializes `message` and publishes it.
pub async fn publish_json<T: Serialize + Sync>(
    queue: &dyn WorkQueue,
    topic: &str,
    message: &T,
    dedup_key: &str,
) -> QueueResult<PublishAck> {
    let payload = serde_json::to_vec(message)?;
    queue.publish(topic, &payload, dedup_key).await
}

/// Publishes, provisioning `streams` and retrying exactly once if the topic
/// was not provisioned yet.
pub async fn publish_provisioned(
    queue: &dyn WorkQueue,
    streams: &[StreamSpec],
    topic: &str,
    payload: &[u8],
    dedup_key: &str,
) -> QueueResult<PublishAck> {
    match queue.publish(topic, payload, dedup_key).await {
        Err(e) if e.is_stream_not_provisioned() => {
            warn!(topic = %topic, "Stream not provisioned, provisioning before retry");
            provision_all(queue, streams).await?;
            queue.publish(topic, payload, dedup_key).await
        }
        other => other,
    }
}

/// Provisions every stream in `streams`.
pub async fn provision_all(queue: &dyn WorkQueue, streams: &[StreamSpec]) -> QueueResult<()> {
    for stream in streams {
        queue.provision(stream).await?;
        info!(stream = stream.name, topics = ?stream.topics, "Stream provisioned");
    }
    Ok(())
}

/// Decodes a delivery's JSON payload.
pub fn decode<T: serde::de::DeserializeOwned>(delivery: &Delivery) -> QueueResult<T> {
    serde_json::from_slice(&delivery.payload).map_err(QueueError::from)
}
