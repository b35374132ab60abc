//! Assembly of the scheduler runtime from configuration and the DI module.

use crate::di::{SchedulerModule, SchedulerModuleExt};
use deadpool_redis::Pool;
use std::sync::Arc;
use std::time::Duration;
use vigil_config::AppConfig;
use vigil_core::VigilResult;
use vigil_queue::{RedisKeys, StreamSpec};
use vigil_resilience::RateLimiter;
use vigil_scheduler::{
    BenchmarkCache, ComplianceClient, DescribeResultHandler, DescribeScheduler, Dispatcher,
    HttpComplianceClient, HttpIntegrationClient, HttpInventoryClient, HttpResultSink,
    IntegrationClient, LeaderElector, Leadership, RedisLeaderLock, RunnerPublisher,
    RunnerResultHandler, RuntimeSettings, SchedulerRuntime, SchedulerServices, Sweepers,
};

/// Builds every scheduling component and the runtime that drives them.
pub fn build_runtime(
    config: &AppConfig,
    module: &SchedulerModule,
    redis_pool: Arc<Pool>,
) -> VigilResult<SchedulerRuntime> {
    let describe_store = module.describe_store();
    let compliance_store = module.compliance_store();
    let queue = module.work_queue();

    let integrations: Arc<dyn IntegrationClient> =
        Arc::new(HttpIntegrationClient::new(&config.services)?);
    let compliance: Arc<dyn ComplianceClient> = Arc::new(HttpComplianceClient::new(&config.services)?);
    let inventory = Arc::new(HttpInventoryClient::new(&config.services)?);
    let sink = Arc::new(HttpResultSink::new(&config.services)?);

    let scheduler = &config.scheduler;
    let dispatcher = Dispatcher::new(
        Arc::clone(&describe_store),
        Arc::clone(&queue),
        Arc::clone(&integrations),
        RateLimiter::per_second(scheduler.credential_requests_per_second),
        config.services.describe_delivery_endpoint.clone(),
    )
    .with_call_deadline(config.services.call_deadline());

    let services = SchedulerServices {
        describe: Arc::new(DescribeScheduler::new(
            Arc::clone(&describe_store),
            Arc::clone(&integrations),
            dispatcher,
            scheduler.clone(),
        )),
        publisher: Arc::new(RunnerPublisher::new(
            Arc::clone(&compliance_store),
            Arc::clone(&queue),
            Arc::clone(&compliance),
            Arc::clone(&integrations),
            StreamSpec::compliance_runner(config.queue.stream_max_len),
            config.compliance.clone(),
            scheduler.max_retries,
        )),
        sweepers: Arc::new(Sweepers::new(
            Arc::clone(&describe_store),
            Arc::clone(&compliance_store),
            Arc::clone(&integrations),
            inventory,
            scheduler.clone(),
        )
        .with_call_deadline(config.services.call_deadline())),
        describe_results: Arc::new(DescribeResultHandler::new(describe_store)),
        runner_results: Arc::new(RunnerResultHandler::new(
            compliance_store,
            sink,
            Arc::new(BenchmarkCache::new(compliance)),
            scheduler.max_retries,
        )),
    };

    let leadership = Leadership::new();
    let elector = LeaderElector::new(
        Arc::new(RedisLeaderLock::new(
            redis_pool,
            &RedisKeys::new(&config.queue.key_prefix),
            scheduler.leader_ttl(),
        )),
        leadership.clone(),
        Duration::from_secs(scheduler.leader_check_interval_secs),
    );

    SchedulerRuntime::new(
        services,
        queue,
        elector,
        leadership,
        RuntimeSettings {
            scheduler: scheduler.clone(),
            compliance: config.compliance.clone(),
            queue: config.queue.clone(),
        },
    )
}
