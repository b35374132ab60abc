//! Leader lock against a real Redis server.
//!
//! Requires Docker to be available on the system.

use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::Redis;
use vigil_config::RedisConfig;
use vigil_queue::{create_pool, RedisKeys};
use vigil_scheduler::{LeaderElector, LeaderLock, Leadership, RedisLeaderLock};

struct TestRedis {
    _container: ContainerAsync<Redis>,
    pool: Arc<deadpool_redis::Pool>,
}

impl TestRedis {
    async fn new() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");
        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let pool = create_pool(&RedisConfig {
            url: format!("redis://127.0.0.1:{}", port),
            pool_size: 4,
        })
        .await
        .expect("Failed to create pool");

        Self {
            _container: container,
            pool: Arc::new(pool),
        }
    }

    fn lock(&self, ttl: Duration) -> RedisLeaderLock {
        RedisLeaderLock::new(Arc::clone(&self.pool), &RedisKeys::new("test"), ttl)
    }
}

#[tokio::test]
async fn test_only_one_instance_leads() {
    let redis = TestRedis::new().await;
    let first = redis.lock(Duration::from_secs(30));
    let second = redis.lock(Duration::from_secs(30));

    assert!(first.try_acquire().await.unwrap());
    assert!(!second.try_acquire().await.unwrap());

    // Refreshing an owned lock keeps it.
    assert!(first.try_acquire().await.unwrap());
    assert!(!second.try_acquire().await.unwrap());
}

#[tokio::test]
async fn test_release_hands_over_leadership() {
    let redis = TestRedis::new().await;
    let first = redis.lock(Duration::from_secs(30));
    let second = redis.lock(Duration::from_secs(30));

    assert!(first.try_acquire().await.unwrap());

    // Releasing a lock held by someone else is a no-op.
    second.release().await.unwrap();
    assert!(!second.try_acquire().await.unwrap());

    first.release().await.unwrap();
    assert!(second.try_acquire().await.unwrap());
}

#[tokio::test]
async fn test_crashed_leader_expires() {
    let redis = TestRedis::new().await;
    let crashed = redis.lock(Duration::from_secs(1));
    let standby = redis.lock(Duration::from_secs(30));

    assert!(crashed.try_acquire().await.unwrap());
    assert!(!standby.try_acquire().await.unwrap());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(standby.try_acquire().await.unwrap());
}

#[tokio::test]
async fn test_elector_sets_leadership() {
    let redis = TestRedis::new().await;
    let leadership = Leadership::new();
    let elector = LeaderElector::new(
        Arc::new(redis.lock(Duration::from_secs(30))),
        leadership.clone(),
        Duration::from_secs(10),
    );

    assert!(elector.check().await);
    assert!(leadership.is_leader());
}
