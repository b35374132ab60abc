//! In-memory work queue.
//!
//! Follows the Redis backend's semantics (provisioning check, dedup window,
//! consumer groups, ack-wait redelivery, delivery limit) without a server.
//! Time is read from `tokio::time`, so tests can pause and advance it.

use crate::error::{QueueError, QueueResult};
use crate::protocol::{ConsumerSpec, StreamSpec};
use crate::queue::{Delivery, PublishAck, WorkQueue};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use vigil_core::SequenceNumber;

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct Pending {
    /// Redelivery is due once this passes.
    due_at: Instant,
    count: u32,
}

#[derive(Debug, Default)]
struct Group {
    /// Index of the next never-delivered entry.
    cursor: usize,
    pending: BTreeMap<u64, Pending>,
}

#[derive(Default)]
struct State {
    provisioned: HashSet<String>,
    entries: HashMap<String, Vec<Entry>>,
    seqs: HashMap<String, u64>,
    dedup: HashMap<(String, String), (u64, Instant)>,
    groups: HashMap<(String, String), Group>,
    acked: Vec<(String, u64)>,
}

/// In-memory [`WorkQueue`].
pub struct InMemoryQueue {
    state: Mutex<State>,
    dedup_window: Duration,
    reject_publishes: AtomicBool,
    setup_failures: AtomicUsize,
    ack_failures: AtomicUsize,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl InMemoryQueue {
    #[must_use]
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            dedup_window,
            reject_publishes: AtomicBool::new(false),
            setup_failures: AtomicUsize::new(0),
            ack_failures: AtomicUsize::new(0),
        }
    }

    /// A queue with `streams` already provisioned.
    #[must_use]
    pub fn provisioned(streams: &[StreamSpec]) -> Self {
        let queue = Self::default();
        {
            let mut state = queue.state.lock();
            for stream in streams {
                state
                    .provisioned
                    .extend(stream.topics.iter().map(|t| (*t).to_string()));
            }
        }
        queue
    }

    /// Makes every publish fail until reset.
    pub fn reject_publishes(&self, reject: bool) {
        self.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Makes the next `times` consumer registrations fail.
    pub fn fail_consumer_setup(&self, times: usize) {
        self.setup_failures.store(times, Ordering::SeqCst);
    }

    /// Makes the next `times` acknowledgements fail.
    pub fn fail_acks(&self, times: usize) {
        self.ack_failures.store(times, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Payloads stored on a topic, in publish order.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .entries
            .get(topic)
            .map(|entries| entries.iter().map(|e| e.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Payloads stored on a topic, decoded as JSON.
    pub fn decoded<T: serde::de::DeserializeOwned>(&self, topic: &str) -> QueueResult<Vec<T>> {
        self.messages(topic)
            .iter()
            .map(|p| serde_json::from_slice(p).map_err(QueueError::from))
            .collect()
    }

    /// Sequence numbers acknowledged on a topic.
    #[must_use]
    pub fn acked(&self, topic: &str) -> Vec<SequenceNumber> {
        self.state
            .lock()
            .acked
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, seq)| SequenceNumber(*seq))
            .collect()
    }

    /// Deliveries of a group not yet acknowledged.
    #[must_use]
    pub fn pending_count(&self, topic: &str, group: &str) -> usize {
        self.state
            .lock()
            .groups
            .get(&(topic.to_string(), group.to_string()))
            .map_or(0, |g| g.pending.len())
    }

    fn delivery(topic: &str, entry: &Entry, count: u32) -> Delivery {
        Delivery {
            topic: topic.to_string(),
            entry_id: entry.seq.to_string(),
            seq: SequenceNumber(entry.seq),
            payload: entry.payload.clone(),
            delivery_count: count,
        }
    }

    fn entry_seq(delivery: &Delivery) -> QueueResult<u64> {
        delivery
            .entry_id
            .parse()
            .map_err(|_| QueueError::Internal(format!("unknown entry id {}", delivery.entry_id)))
    }

    fn poll(&self, spec: &ConsumerSpec, max: usize) -> Vec<Delivery> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let entries = state.entries.get(&spec.topic).cloned().unwrap_or_default();
        let key = (spec.topic.clone(), spec.group.clone());
        let mut dropped = Vec::new();
        let mut out = Vec::new();

        let Some(group) = state.groups.get_mut(&key) else {
            return out;
        };

        for (seq, pending) in &mut group.pending {
            if out.len() >= max {
                break;
            }
            if now < pending.due_at {
                continue;
            }
            if pending.count >= spec.max_deliver {
                dropped.push(*seq);
                continue;
            }
            if let Some(entry) = entries.iter().find(|e| e.seq == *seq) {
                pending.count += 1;
                pending.due_at = now + spec.ack_wait;
                out.push(Self::delivery(&spec.topic, entry, pending.count));
            }
        }
        for seq in &dropped {
            group.pending.remove(seq);
        }
        if !out.is_empty() {
            return out;
        }

        while out.len() < max && group.cursor < entries.len() {
            let entry = &entries[group.cursor];
            group.cursor += 1;
            group.pending.insert(
                entry.seq,
                Pending {
                    due_at: now + spec.ack_wait,
                    count: 1,
                },
            );
            out.push(Self::delivery(&spec.topic, entry, 1));
        }
        out
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn provision(&self, stream: &StreamSpec) -> QueueResult<()> {
        let mut state = self.state.lock();
        for topic in stream.topics {
            state.provisioned.insert((*topic).to_string());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], dedup_key: &str) -> QueueResult<PublishAck> {
        if self.reject_publishes.load(Ordering::SeqCst) {
            return Err(QueueError::Internal("publish rejected".to_string()));
        }
        let mut state = self.state.lock();
        if !state.provisioned.contains(topic) {
            return Err(QueueError::StreamNotProvisioned(topic.to_string()));
        }

        let now = Instant::now();
        let key = (topic.to_string(), dedup_key.to_string());
        if let Some((seq, at)) = state.dedup.get(&key) {
            if now.duration_since(*at) < self.dedup_window {
                return Ok(PublishAck {
                    seq: SequenceNumber(*seq),
                    duplicate: true,
                });
            }
        }

        let seq = {
            let counter = state.seqs.entry(topic.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        state.entries.entry(topic.to_string()).or_default().push(Entry {
            seq,
            payload: payload.to_vec(),
        });
        state.dedup.insert(key, (seq, now));
        Ok(PublishAck {
            seq: SequenceNumber(seq),
            duplicate: false,
        })
    }

    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> QueueResult<()> {
        if Self::take_failure(&self.setup_failures) {
            return Err(QueueError::Internal("consumer group unavailable".to_string()));
        }
        self.state
            .lock()
            .groups
            .entry((spec.topic.clone(), spec.group.clone()))
            .or_default();
        Ok(())
    }

    async fn fetch(
        &self,
        spec: &ConsumerSpec,
        max: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>> {
        let out = self.poll(spec, max);
        if out.is_empty() && !block.is_zero() {
            tokio::time::sleep(block.min(Duration::from_millis(50))).await;
            return Ok(self.poll(spec, max));
        }
        Ok(out)
    }

    async fn ack(&self, spec: &ConsumerSpec, delivery: &Delivery) -> QueueResult<()> {
        if Self::take_failure(&self.ack_failures) {
            return Err(QueueError::Internal("ack rejected".to_string()));
        }
        let seq = Self::entry_seq(delivery)?;
        let mut state = self.state.lock();
        if let Some(group) = state.groups.get_mut(&(spec.topic.clone(), spec.group.clone())) {
            group.pending.remove(&seq);
        }
        state.acked.push((spec.topic.clone(), seq));
        Ok(())
    }

    async fn nak(&self, spec: &ConsumerSpec, delivery: &Delivery) -> QueueResult<()> {
        let seq = Self::entry_seq(delivery)?;
        let mut state = self.state.lock();
        if let Some(group) = state.groups.get_mut(&(spec.topic.clone(), spec.group.clone())) {
            if delivery.delivery_count >= spec.max_deliver {
                group.pending.remove(&seq);
            } else if let Some(pending) = group.pending.get_mut(&seq) {
                pending.due_at = Instant::now();
            }
        }
        Ok(())
    }

    async fn in_progress(&self, spec: &ConsumerSpec, delivery: &Delivery) -> QueueResult<()> {
        let seq = Self::entry_seq(delivery)?;
        let mut state = self.state.lock();
        if let Some(pending) = state
            .groups
            .get_mut(&(spec.topic.clone(), spec.group.clone()))
            .and_then(|g| g.pending.get_mut(&seq))
        {
            pending.due_at = Instant::now() + spec.ack_wait;
        }
        Ok(())
    }

    async fn health_check(&self) -> QueueResult<()> {
        Ok(())
    }
}
