//! Dependency injection module using Shaku.
//!
//! The job store and the work queue are resolved from [`SchedulerModule`];
//! the scheduling components are built on top of them in [`crate::app`].

use deadpool_redis::Pool;
use shaku::{module, HasComponent};
use std::sync::Arc;
use vigil_config::QueueConfig;
use vigil_queue::{RedisKeys, RedisStreamQueue, RedisStreamQueueParameters, WorkQueue};
use vigil_repository::{
    ComplianceStore, DatabasePool, DatabasePoolInterface, DatabasePoolParameters, DescribeJobStore,
    PgComplianceStore, PgDescribeJobStore,
};

module! {
    pub SchedulerModule {
        components = [
            DatabasePool,
            PgDescribeJobStore,
            PgComplianceStore,
            RedisStreamQueue,
        ],
        providers = [],
    }
}

/// Builds the module around already connected pools.
pub fn build_scheduler_module(
    db_pool: &DatabasePool,
    redis_pool: Arc<Pool>,
    queue_config: &QueueConfig,
) -> Arc<SchedulerModule> {
    let module = SchedulerModule::builder()
        .with_component_parameters::<DatabasePool>(DatabasePoolParameters {
            pool: db_pool.inner().clone(),
        })
        .with_component_parameters::<RedisStreamQueue>(RedisStreamQueueParameters {
            pool: redis_pool,
            keys: RedisKeys::new(&queue_config.key_prefix),
            dedup_window: queue_config.dedup_window(),
        })
        .build();

    Arc::new(module)
}

/// Typed accessors over the module.
pub trait SchedulerModuleExt {
    fn database_pool(&self) -> Arc<dyn DatabasePoolInterface>;
    fn describe_store(&self) -> Arc<dyn DescribeJobStore>;
    fn compliance_store(&self) -> Arc<dyn ComplianceStore>;
    fn work_queue(&self) -> Arc<dyn WorkQueue>;
}

impl SchedulerModuleExt for SchedulerModule {
    fn database_pool(&self) -> Arc<dyn DatabasePoolInterface> {
        self.resolve()
    }

    fn describe_store(&self) -> Arc<dyn DescribeJobStore> {
        self.resolve()
    }

    fn compliance_store(&self) -> Arc<dyn ComplianceStore> {
        self.resolve()
    }

    fn work_queue(&self) -> Arc<dyn WorkQueue> {
        self.resolve()
    }
}
