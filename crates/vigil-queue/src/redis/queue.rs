//! Redis Streams work queue implementation.
//!
//! Each topic is one stream. Publishing runs as a Lua script so the
//! provisioning check, the dedup window lookup, the sequence assignment and
//! the `XADD` happen atomically. Consumers read through consumer groups;
//! unacknowledged entries are reclaimed with `XCLAIM` once idle longer than
//! the consumer's ack-wait window.

use super::RedisKeys;
use crate::error::{QueueError, QueueResult};
use crate::metrics::QueueMetrics;
use crate::protocol::{ConsumerSpec, StreamSpec};
use crate::queue::{Delivery, PublishAck, WorkQueue};
use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::streams::{
    StreamClaimOptions, StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Script};
use shaku::Component;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vigil_config::QueueConfig;
use vigil_core::SequenceNumber;

/// Error code the publish script raises for an unprovisioned topic.
const NOT_PROVISIONED: &str = "NOSTREAM";

// KEYS: topic marker, dedup entry, sequence counter, stream
// ARGV: payload, dedup window seconds
const PUBLISH_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return redis.error_reply('NOSTREAM topic not provisioned')
end
local existing = redis.call('GET', KEYS[2])
if existing then
  return {tonumber(existing), 1}
end
local seq = redis.call('INCR', KEYS[3])
local max_len = tonumber(redis.call('HGET', KEYS[1], 'max_len') or '0')
if max_len > 0 then
  redis.call('XADD', KEYS[4], 'MAXLEN', '~', max_len, '*', 'seq', seq, 'payload', ARGV[1])
else
  redis.call('XADD', KEYS[4], '*', 'seq', seq, 'payload', ARGV[1])
end
redis.call('SET', KEYS[2], seq, 'EX', ARGV[2])
return {seq, 0}
";

/// Redis Streams backed [`WorkQueue`].
#[derive(Component)]
#[shaku(interface = WorkQueue)]
pub struct RedisStreamQueue {
    pool: Arc<Pool>,
    keys: RedisKeys,
    #[shaku(default = Duration::from_secs(120))]
    dedup_window: Duration,
}

impl RedisStreamQueue {
    /// Create a new Redis stream queue.
    pub fn new(pool: Arc<Pool>, config: &QueueConfig) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(&config.key_prefix),
            dedup_window: config.dedup_window(),
        }
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> QueueResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    fn to_delivery(topic: &str, entry: &StreamId, delivery_count: u32) -> Delivery {
        Delivery {
            topic: topic.to_string(),
            entry_id: entry.id.clone(),
            seq: SequenceNumber(entry.get::<u64>("seq").unwrap_or_default()),
            payload: entry.get::<Vec<u8>>("payload").unwrap_or_default(),
            delivery_count,
        }
    }

    /// Claims entries idle longer than the ack-wait window. Entries that
    /// already used up their deliveries are acknowledged and dropped.
    async fn reclaim(&self, spec: &ConsumerSpec, max: usize) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.conn().await?;
        let stream = self.keys.stream(&spec.topic);
        let ack_wait_ms = u64::try_from(spec.ack_wait.as_millis()).unwrap_or(u64::MAX);

        // The pending list is ordered by entry ID, not idle time, so page
        // through it until `max` expired entries are found.
        let mut expired = Vec::new();
        let mut start = "-".to_string();
        loop {
            let page: StreamPendingCountReply = conn
                .xpending_count(&stream, &spec.group, &start, "+", max)
                .await?;
            let next = match page.ids.last() {
                Some(last) if page.ids.len() >= max => Some(next_entry_id(&last.id)?),
                _ => None,
            };

            for entry in page.ids {
                if u64::try_from(entry.last_delivered_ms).unwrap_or_default() < ack_wait_ms {
                    continue;
                }
                let delivered = u32::try_from(entry.times_delivered).unwrap_or(u32::MAX);
                if delivered >= spec.max_deliver {
                    let _: u64 = conn.xack(&stream, &spec.group, &[&entry.id]).await?;
                    QueueMetrics::dropped(&spec.topic);
                    warn!(
                        topic = %spec.topic,
                        entry_id = %entry.id,
                        delivered,
                        "Dropping message after delivery limit"
                    );
                } else if expired.len() < max {
                    expired.push((entry.id, delivered));
                }
            }

            match next {
                Some(id) if expired.len() < max => start = id,
                _ => break,
            }
        }

        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = expired.iter().map(|(id, _)| id.as_str()).collect();
        let claimed: StreamClaimReply = conn
            .xclaim(&stream, &spec.group, &spec.consumer, ack_wait_ms, &ids)
            .await?;

        let deliveries: Vec<Delivery> = claimed
            .ids
            .iter()
            .map(|entry| {
                let previous = expired
                    .iter()
                    .find(|(id, _)| *id == entry.id)
                    .map_or(0, |(_, n)| *n);
                Self::to_delivery(&spec.topic, entry, previous + 1)
            })
            .collect();

        if !deliveries.is_empty() {
            QueueMetrics::redelivered(&spec.topic, deliveries.len() as u64);
            debug!(topic = %spec.topic, count = deliveries.len(), "Reclaimed expired deliveries");
        }
        Ok(deliveries)
    }
}

/// Smallest stream entry ID after `id`, for paging an inclusive range.
fn next_entry_id(id: &str) -> QueueResult<String> {
    let invalid = || QueueError::Internal(format!("invalid stream entry id {id}"));
    let (ms, seq) = id.split_once('-').ok_or_else(invalid)?;
    let ms: u64 = ms.parse().map_err(|_| invalid())?;
    let seq: u64 = seq.parse().map_err(|_| invalid())?;
    Ok(match seq.checked_add(1) {
        Some(seq) => format!("{ms}-{seq}"),
        None => format!("{}-0", ms.checked_add(1).ok_or_else(invalid)?),
    })
}

#[async_trait]
impl WorkQueue for RedisStreamQueue {
    async fn provision(&self, stream: &StreamSpec) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let max_len = stream.max_len.unwrap_or(0);
        for topic in stream.topics {
            let _: () = redis::pipe()
                .hset(self.keys.topic(topic), "stream", stream.name)
                .ignore()
                .hset(self.keys.topic(topic), "max_len", max_len)
                .ignore()
                .query_async(&mut *conn)
                .await?;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], dedup_key: &str) -> QueueResult<PublishAck> {
        let mut conn = self.conn().await?;
        let result: Result<(u64, u8), redis::RedisError> = Script::new(PUBLISH_SCRIPT)
            .key(self.keys.topic(topic))
            .key(self.keys.dedup(topic, dedup_key))
            .key(self.keys.seq(topic))
            .key(self.keys.stream(topic))
            .arg(payload)
            .arg(self.dedup_window.as_secs().max(1))
            .invoke_async(&mut *conn)
            .await;

        match result {
            Ok((seq, duplicate)) => {
                let ack = PublishAck {
                    seq: SequenceNumber(seq),
                    duplicate: duplicate == 1,
                };
                if ack.duplicate {
                    QueueMetrics::duplicate(topic);
                    debug!(topic = %topic, dedup_key = %dedup_key, seq, "Duplicate publish");
                } else {
                    QueueMetrics::published(topic);
                }
                Ok(ack)
            }
            Err(e) if e.code() == Some(NOT_PROVISIONED) => {
                Err(QueueError::StreamNotProvisioned(topic.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let result: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(self.keys.stream(&spec.topic), &spec.group, "0")
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch(
        &self,
        spec: &ConsumerSpec,
        max: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>> {
        let reclaimed = self.reclaim(spec, max).await?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        let mut conn = self.conn().await?;
        let stream = self.keys.stream(&spec.topic);
        let options = StreamReadOptions::default()
            .group(&spec.group, &spec.consumer)
            .count(max)
            .block(usize::try_from(block.as_millis()).unwrap_or(usize::MAX));
        let reply: Option<StreamReadReply> = conn.xread_options(&[&stream], &[">"], &options).await?;

        Ok(reply
            .map(|r| {
                r.keys
                    .iter()
                    .flat_map(|key| key.ids.iter())
                    .map(|entry| Self::to_delivery(&spec.topic, entry, 1))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ack(&self, spec: &ConsumerSpec, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let _: u64 = conn
            .xack(self.keys.stream(&spec.topic), &spec.group, &[&delivery.entry_id])
            .await?;
        QueueMetrics::acked(&spec.topic);
        Ok(())
    }

    async fn nak(&self, spec: &ConsumerSpec, delivery: &Delivery) -> QueueResult<()> {
        QueueMetrics::nacked(&spec.topic);
        if delivery.delivery_count >= spec.max_deliver {
            let mut conn = self.conn().await?;
            let _: u64 = conn
                .xack(self.keys.stream(&spec.topic), &spec.group, &[&delivery.entry_id])
                .await?;
            QueueMetrics::dropped(&spec.topic);
            warn!(topic = %spec.topic, seq = %delivery.seq, "Dropping message after delivery limit");
            return Ok(());
        }

        // Backdate the idle time so the next fetch reclaims it.
        let mut conn = self.conn().await?;
        let idle_ms = usize::try_from(spec.ack_wait.as_millis()).unwrap_or(usize::MAX);
        let options = StreamClaimOptions::default().idle(idle_ms).with_justid();
        let _: Vec<String> = conn
            .xclaim_options(
                self.keys.stream(&spec.topic),
                &spec.group,
                &spec.consumer,
                0,
                &[&delivery.entry_id],
                options,
            )
            .await?;
        Ok(())
    }

    async fn in_progress(&self, spec: &ConsumerSpec, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let options = StreamClaimOptions::default().with_justid();
        let _: Vec<String> = conn
            .xclaim_options(
                self.keys.stream(&spec.topic),
                &spec.group,
                &spec.consumer,
                0,
                &[&delivery.entry_id],
                options,
            )
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut *conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_entry_id() {
        assert_eq!(next_entry_id("1700000000000-0").unwrap(), "1700000000000-1");
        assert_eq!(next_entry_id("5-18446744073709551615").unwrap(), "6-0");
        assert!(next_entry_id("garbage").is_err());
    }
}
