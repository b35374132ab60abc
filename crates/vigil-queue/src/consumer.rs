//! Durable consumer loop and the in-progress heartbeat.

use crate::error::{QueueError, QueueResult};
use crate::protocol::ConsumerSpec;
use crate::queue::{Delivery, WorkQueue};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::future::retry_notify;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What to do with a delivery once it has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; acknowledge.
    Ack,
    /// Transient failure; redeliver.
    Nak,
    /// Undecodable; acknowledge without processing so it is never retried.
    Drop,
}

/// Handles one delivery of a consumer.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Disposition;
}

/// Re-signals "in progress" for a delivery on a fixed interval until dropped.
pub struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Starts the heartbeat. The first signal is sent after one `interval`.
    pub fn start(
        queue: Arc<dyn WorkQueue>,
        spec: ConsumerSpec,
        delivery: Delivery,
        interval: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                if let Err(e) = queue.in_progress(&spec, &delivery).await {
                    warn!(topic = %spec.topic, seq = %delivery.seq, error = %e, "Heartbeat failed");
                }
            }
        });
        Self { handle }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Pulls deliveries for one consumer group and dispatches them to a handler.
pub struct Consumer {
    queue: Arc<dyn WorkQueue>,
    spec: ConsumerSpec,
    batch_size: usize,
    block: Duration,
    heartbeat_interval: Option<Duration>,
}

impl Consumer {
    pub fn new(queue: Arc<dyn WorkQueue>, spec: ConsumerSpec, batch_size: usize, block: Duration) -> Self {
        Self {
            queue,
            spec,
            batch_size,
            block,
            heartbeat_interval: None,
        }
    }

    /// Keeps each delivery's ack-wait window open while its handler runs.
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn spec(&self) -> &ConsumerSpec {
        &self.spec
    }

    /// Fetches one batch and handles it. Returns the number of deliveries seen.
    pub async fn poll_once(&self, handler: &dyn MessageHandler) -> QueueResult<usize> {
        let deliveries = self
            .queue
            .fetch(&self.spec, self.batch_size, self.block)
            .await?;

        for delivery in &deliveries {
            let _heartbeat = self.heartbeat_interval.map(|interval| {
                Heartbeat::start(
                    Arc::clone(&self.queue),
                    self.spec.clone(),
                    delivery.clone(),
                    interval,
                )
            });

            let disposition = handler.handle(delivery).await;
            let settled = match disposition {
                Disposition::Ack => self.queue.ack(&self.spec, delivery).await,
                Disposition::Drop => {
                    warn!(topic = %self.spec.topic, seq = %delivery.seq, "Dropping malformed message");
                    self.queue.ack(&self.spec, delivery).await
                }
                Disposition::Nak => {
                    debug!(topic = %self.spec.topic, seq = %delivery.seq, "Message will be redelivered");
                    self.queue.nak(&self.spec, delivery).await
                }
            };
            // An unsettled delivery comes back after its ack wait.
            if let Err(e) = settled {
                error!(
                    topic = %self.spec.topic,
                    seq = %delivery.seq,
                    ?disposition,
                    error = %e,
                    "Failed to settle delivery"
                );
            }
        }

        Ok(deliveries.len())
    }

    fn pause_policy() -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_interval(Duration::from_secs(30))
            .with_max_elapsed_time(None)
            .build()
    }

    /// Creates the consumer group, retrying until it succeeds.
    async fn register(&self) -> QueueResult<()> {
        retry_notify(
            Self::pause_policy(),
            || async move {
                self.queue
                    .ensure_consumer(&self.spec)
                    .await
                    .map_err(backoff::Error::transient)
            },
            |e: QueueError, wait: Duration| {
                warn!(
                    topic = %self.spec.topic,
                    group = %self.spec.group,
                    error = %e,
                    retry_in = ?wait,
                    "Consumer registration failed"
                );
            },
        )
        .await
    }

    /// Runs until `shutdown` fires. Shutdown is checked between batches so a
    /// batch in flight always finishes. Registration and poll failures are
    /// logged and retried with exponential backoff.
    pub async fn run(
        &self,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tokio::select! {
            registered = self.register() => {
                if let Err(e) = registered {
                    error!(topic = %self.spec.topic, error = %e, "Consumer registration abandoned");
                    return;
                }
            }
            _ = shutdown.recv() => {
                info!(topic = %self.spec.topic, "Consumer stopping before registration");
                return;
            }
        }
        info!(topic = %self.spec.topic, group = %self.spec.group, "Consumer started");

        let mut pause = Self::pause_policy();
        loop {
            if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                info!(topic = %self.spec.topic, "Consumer stopping");
                return;
            }
            match self.poll_once(handler.as_ref()).await {
                Ok(_) => pause.reset(),
                Err(e) => {
                    let wait = pause.next_backoff().unwrap_or(pause.max_interval);
                    error!(topic = %self.spec.topic, error = %e, "Consumer poll failed");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryQueue;
    use crate::protocol::{topics, StreamSpec};
    use parking_lot::Mutex;

    struct Scripted {
        dispositions: Mutex<Vec<Disposition>>,
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl MessageHandler for Scripted {
        async fn handle(&self, delivery: &Delivery) -> Disposition {
            self.seen.lock().push(delivery.delivery_count);
            self.dispositions.lock().remove(0)
        }
    }

    fn consumer(queue: Arc<InMemoryQueue>) -> Consumer {
        let spec = ConsumerSpec::new(
            "scheduler",
            "scheduler-1",
            topics::DESCRIBE_RESULTS,
            Duration::from_secs(300),
            2,
        );
        Consumer::new(queue, spec, 10, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_nak_then_ack() {
        let queue = Arc::new(InMemoryQueue::provisioned(&[StreamSpec::describe()]));
        let consumer = consumer(Arc::clone(&queue));
        queue.ensure_consumer(consumer.spec()).await.unwrap();
        queue.publish(topics::DESCRIBE_RESULTS, b"{}", "k").await.unwrap();

        let handler = Scripted {
            dispositions: Mutex::new(vec![Disposition::Nak, Disposition::Ack]),
            seen: Mutex::new(Vec::new()),
        };
        assert_eq!(consumer.poll_once(&handler).await.unwrap(), 1);
        assert_eq!(consumer.poll_once(&handler).await.unwrap(), 1);
        assert_eq!(*handler.seen.lock(), vec![1, 2]);
        assert_eq!(queue.acked(topics::DESCRIBE_RESULTS).len(), 1);
    }

    #[tokio::test]
    async fn test_drop_acknowledges() {
        let queue = Arc::new(InMemoryQueue::provisioned(&[StreamSpec::describe()]));
        let consumer = consumer(Arc::clone(&queue));
        queue.ensure_consumer(consumer.spec()).await.unwrap();
        queue.publish(topics::DESCRIBE_RESULTS, b"garbage", "k").await.unwrap();

        let handler = Scripted {
            dispositions: Mutex::new(vec![Disposition::Drop]),
            seen: Mutex::new(Vec::new()),
        };
        consumer.poll_once(&handler).await.unwrap();
        assert_eq!(queue.pending_count(topics::DESCRIBE_RESULTS, "scheduler"), 0);
        assert_eq!(consumer.poll_once(&handler).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let queue = Arc::new(InMemoryQueue::provisioned(&[StreamSpec::describe()]));
        let consumer = consumer(queue);
        let handler: Arc<dyn MessageHandler> = Arc::new(Scripted {
            dispositions: Mutex::new(Vec::new()),
            seen: Mutex::new(Vec::new()),
        });
        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();
        consumer.run(handler, rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_consumer_registration() {
        let queue = Arc::new(InMemoryQueue::provisioned(&[StreamSpec::describe()]));
        queue.fail_consumer_setup(3);
        queue.publish(topics::DESCRIBE_RESULTS, b"{}", "k").await.unwrap();

        let spec = consumer(Arc::clone(&queue)).spec().clone();
        let consumer = Consumer::new(
            Arc::clone(&queue) as Arc<dyn WorkQueue>,
            spec,
            10,
            Duration::from_millis(50),
        );
        let handler: Arc<dyn MessageHandler> = Arc::new(Scripted {
            dispositions: Mutex::new(vec![Disposition::Ack]),
            seen: Mutex::new(Vec::new()),
        });
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(async move { consumer.run(handler, rx).await });

        for _ in 0..600 {
            if !queue.acked(topics::DESCRIBE_RESULTS).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(queue.acked(topics::DESCRIBE_RESULTS).len(), 1);

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ack_is_logged_and_batch_continues() {
        let queue = Arc::new(InMemoryQueue::provisioned(&[StreamSpec::describe()]));
        let consumer = consumer(Arc::clone(&queue));
        queue.ensure_consumer(consumer.spec()).await.unwrap();
        queue.publish(topics::DESCRIBE_RESULTS, b"{}", "a").await.unwrap();
        queue.publish(topics::DESCRIBE_RESULTS, b"{}", "b").await.unwrap();
        queue.fail_acks(1);

        let handler = Scripted {
            dispositions: Mutex::new(vec![Disposition::Ack, Disposition::Ack, Disposition::Ack]),
            seen: Mutex::new(Vec::new()),
        };
        assert_eq!(consumer.poll_once(&handler).await.unwrap(), 2);
        assert_eq!(queue.acked(topics::DESCRIBE_RESULTS).len(), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(consumer.poll_once(&handler).await.unwrap(), 1);
        assert_eq!(*handler.seen.lock(), vec![1, 1, 2]);
        assert_eq!(queue.acked(topics::DESCRIBE_RESULTS).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_delivery_alive() {
        let queue = Arc::new(InMemoryQueue::provisioned(&[StreamSpec::describe()]));
        let spec = ConsumerSpec::new(
            "scheduler",
            "scheduler-1",
            topics::DESCRIBE_RESULTS,
            Duration::from_secs(60),
            2,
        );
        queue.ensure_consumer(&spec).await.unwrap();
        queue.publish(topics::DESCRIBE_RESULTS, b"{}", "k").await.unwrap();
        let delivery = queue.fetch(&spec, 1, Duration::ZERO).await.unwrap().remove(0);

        let heartbeat = Heartbeat::start(
            Arc::clone(&queue) as Arc<dyn WorkQueue>,
            spec.clone(),
            delivery,
            Duration::from_secs(15),
        );
        for _ in 0..8 {
            tokio::time::advance(Duration::from_secs(15)).await;
            tokio::task::yield_now().await;
        }
        assert!(queue.fetch(&spec, 1, Duration::ZERO).await.unwrap().is_empty());

        drop(heartbeat);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(queue.fetch(&spec, 1, Duration::ZERO).await.unwrap().len(), 1);
    }
}
