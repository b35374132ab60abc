//! Leader election across scheduler instances.
//!
//! Only the leader runs the create, dispatch, publish and sweep loops.
//! Result consumers run on every instance; the conditional store updates
//! make concurrent consumption safe.

use crate::metrics::SchedulerMetrics;
use async_trait::async_trait;
use deadpool_redis::Pool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::{VigilError, VigilResult};
use vigil_queue::{QueueError, RedisKeys};

/// Deletes the lock only while it still holds our id.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Extends the lock only while it still holds our id.
const REFRESH_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("expire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Acquires or refreshes the lock. Returns whether this instance holds it.
    async fn try_acquire(&self) -> VigilResult<bool>;

    /// Gives the lock up if this instance holds it.
    async fn release(&self) -> VigilResult<()>;

    fn holder_id(&self) -> &str;
}

fn redis_error(err: impl Into<QueueError>) -> VigilError {
    err.into().into()
}

/// Lock stored in Redis with a TTL; a crashed leader loses it after `ttl`.
pub struct RedisLeaderLock {
    pool: Arc<Pool>,
    key: String,
    id: String,
    ttl: Duration,
}

impl RedisLeaderLock {
    pub fn new(pool: Arc<Pool>, keys: &RedisKeys, ttl: Duration) -> Self {
        Self {
            pool,
            key: keys.scheduler_lock(),
            id: Uuid::new_v4().to_string(),
            ttl,
        }
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }
}

#[async_trait]
impl LeaderLock for RedisLeaderLock {
    async fn try_acquire(&self) -> VigilResult<bool> {
        let mut conn = self.pool.get().await.map_err(redis_error)?;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.id)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs())
            .query_async(&mut *conn)
            .await
            .map_err(redis_error)?;
        if acquired.is_some() {
            return Ok(true);
        }

        let refreshed: i64 = redis::Script::new(REFRESH_SCRIPT)
            .key(&self.key)
            .arg(&self.id)
            .arg(self.ttl_secs())
            .invoke_async(&mut *conn)
            .await
            .map_err(redis_error)?;
        Ok(refreshed == 1)
    }

    async fn release(&self) -> VigilResult<()> {
        let mut conn = self.pool.get().await.map_err(redis_error)?;
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.id)
            .invoke_async(&mut *conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    fn holder_id(&self) -> &str {
        &self.id
    }
}

/// Lock for a single-instance deployment; always held.
pub struct SingleInstanceLock {
    id: String,
}

impl SingleInstanceLock {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
        }
    }
}

impl Default for SingleInstanceLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaderLock for SingleInstanceLock {
    async fn try_acquire(&self) -> VigilResult<bool> {
        Ok(true)
    }

    async fn release(&self) -> VigilResult<()> {
        Ok(())
    }

    fn holder_id(&self) -> &str {
        &self.id
    }
}

/// Shared view of whether this instance currently leads.
#[derive(Clone, Default)]
pub struct Leadership {
    flag: Arc<AtomicBool>,
}

impl Leadership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn set(&self, is_leader: bool) {
        SchedulerMetrics::set_leader(is_leader);
        self.flag.store(is_leader, Ordering::SeqCst);
    }
}

/// Elects this instance leader when possible and keeps the lock refreshed.
pub struct LeaderElector {
    lock: Arc<dyn LeaderLock>,
    leadership: Leadership,
    check_interval: Duration,
}

impl LeaderElector {
    pub fn new(lock: Arc<dyn LeaderLock>, leadership: Leadership, check_interval: Duration) -> Self {
        Self {
            lock,
            leadership,
            check_interval,
        }
    }

    /// One election round. A lock backend failure demotes this instance.
    pub async fn check(&self) -> bool {
        let was_leader = self.leadership.is_leader();
        let is_leader = match self.lock.try_acquire().await {
            Ok(held) => held,
            Err(e) => {
                warn!(error = %e, "Leader lock check failed");
                false
            }
        };

        match (was_leader, is_leader) {
            (false, true) => info!(instance_id = %self.lock.holder_id(), "Acquired scheduler leadership"),
            (true, false) => warn!(instance_id = %self.lock.holder_id(), "Lost scheduler leadership"),
            _ => debug!(is_leader, "Leadership unchanged"),
        }
        self.leadership.set(is_leader);
        is_leader
    }

    /// Runs election rounds until shutdown, then releases the lock.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }

        if self.leadership.is_leader() {
            if let Err(e) = self.lock.release().await {
                warn!(error = %e, "Failed to release scheduler leadership");
            } else {
                info!("Released scheduler leadership");
            }
        }
        self.leadership.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct ScriptedLock {
        answers: Mutex<Vec<VigilResult<bool>>>,
        released: AtomicBool,
    }

    #[async_trait]
    impl LeaderLock for ScriptedLock {
        async fn try_acquire(&self) -> VigilResult<bool> {
            self.answers.lock().remove(0)
        }

        async fn release(&self) -> VigilResult<()> {
            self.released.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn holder_id(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn test_lock_error_demotes_leader() {
        let lock = Arc::new(ScriptedLock {
            answers: Mutex::new(vec![
                Ok(true),
                Err(VigilError::Queue("connection reset".into())),
                Ok(true),
            ]),
            released: AtomicBool::new(false),
        });
        let leadership = Leadership::new();
        let elector = LeaderElector::new(lock, leadership.clone(), Duration::from_secs(10));

        assert!(elector.check().await);
        assert!(leadership.is_leader());
        assert!(!elector.check().await);
        assert!(!leadership.is_leader());
        assert!(elector.check().await);
    }

    #[tokio::test]
    async fn test_shutdown_releases_held_lock() {
        let lock = Arc::new(ScriptedLock {
            answers: Mutex::new(vec![Ok(true)]),
            released: AtomicBool::new(false),
        });
        let leadership = Leadership::new();
        let elector = Arc::new(LeaderElector::new(
            Arc::clone(&lock) as Arc<dyn LeaderLock>,
            leadership.clone(),
            Duration::from_secs(3600),
        ));

        let (tx, rx) = broadcast::channel(1);
        let task = {
            let elector = Arc::clone(&elector);
            tokio::spawn(async move { elector.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(leadership.is_leader());

        tx.send(()).unwrap();
        task.await.unwrap();
        assert!(lock.released.load(Ordering::SeqCst));
        assert!(!leadership.is_leader());
    }

    #[tokio::test]
    async fn test_single_instance_always_leads() {
        let elector = LeaderElector::new(
            Arc::new(SingleInstanceLock::new()),
            Leadership::new(),
            Duration::from_secs(10),
        );
        assert!(elector.check().await);
    }
}
