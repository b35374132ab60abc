//! Scheduler runtime: the periodic loops, the cron-driven runner publisher
//! and the result consumers.
//!
//! ```text
//!   leader election ──▶ Leadership
//!                          │ gates
//!   create (60s) · dispatch (30s) · runner publish (cron)
//!   describe timeouts · resource removal (120s) · cleanup (1h)
//!
//!   describe-results consumer · compliance-runner-results consumer  (every instance)
//! ```

use crate::consumers::{DescribeResultHandler, RunnerResultHandler};
use crate::describe::DescribeScheduler;
use crate::leader::{LeaderElector, Leadership};
use crate::metrics::SchedulerMetrics;
use crate::publisher::RunnerPublisher;
use crate::sweepers::Sweepers;
use chrono::Utc;
use cron::Schedule;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;
use vigil_config::{ComplianceConfig, QueueConfig, SchedulerConfig};
use vigil_core::{VigilError, VigilResult};
use vigil_queue::{
    provision_all, topics, Consumer, ConsumerSpec, MessageHandler, StreamSpec, WorkQueue,
};

/// Consumer group of the scheduler instances.
pub const CONSUMER_GROUP: &str = "vigil-scheduler";

/// The components the loops drive.
pub struct SchedulerServices {
    pub describe: Arc<DescribeScheduler>,
    pub publisher: Arc<RunnerPublisher>,
    pub sweepers: Arc<Sweepers>,
    pub describe_results: Arc<DescribeResultHandler>,
    pub runner_results: Arc<RunnerResultHandler>,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub scheduler: SchedulerConfig,
    pub compliance: ComplianceConfig,
    pub queue: QueueConfig,
}

pub struct SchedulerRuntime {
    instance_id: String,
    services: Arc<SchedulerServices>,
    queue: Arc<dyn WorkQueue>,
    elector: Arc<LeaderElector>,
    leadership: Leadership,
    publish_schedule: Schedule,
    settings: RuntimeSettings,
    shutdown_tx: broadcast::Sender<()>,
}

impl SchedulerRuntime {
    pub fn new(
        services: SchedulerServices,
        queue: Arc<dyn WorkQueue>,
        elector: LeaderElector,
        leadership: Leadership,
        settings: RuntimeSettings,
    ) -> VigilResult<Self> {
        let publish_schedule = Schedule::from_str(&settings.compliance.publish_schedule).map_err(|e| {
            VigilError::Configuration(format!(
                "invalid compliance publish schedule {:?}: {e}",
                settings.compliance.publish_schedule
            ))
        })?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            instance_id: format!("scheduler-{}", Uuid::new_v4()),
            services: Arc::new(services),
            queue,
            elector: Arc::new(elector),
            leadership,
            publish_schedule,
            settings,
            shutdown_tx,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    /// Streams the scheduler publishes to.
    pub fn streams(&self) -> [StreamSpec; 2] {
        [
            StreamSpec::describe(),
            StreamSpec::compliance_runner(self.settings.queue.stream_max_len),
        ]
    }

    /// Provisions the streams and spawns every loop.
    pub async fn start(&self) -> VigilResult<Vec<JoinHandle<()>>> {
        provision_all(self.queue.as_ref(), &self.streams()).await?;

        info!(instance_id = %self.instance_id, "Starting scheduler runtime");
        let scheduler = &self.settings.scheduler;

        let mut handles = vec![self.spawn_election()];

        let describe = Arc::clone(&self.services.describe);
        handles.push(self.spawn_periodic(
            "describe_create",
            Duration::from_secs(scheduler.create_interval_secs),
            move || {
                let describe = Arc::clone(&describe);
                async move { describe.create_phase().await.map(drop) }
            },
        ));

        let describe = Arc::clone(&self.services.describe);
        handles.push(self.spawn_periodic(
            "describe_dispatch",
            Duration::from_secs(scheduler.dispatch_interval_secs),
            move || {
                let describe = Arc::clone(&describe);
                async move { describe.dispatch_phase().await.map(drop) }
            },
        ));

        let sweepers = Arc::clone(&self.services.sweepers);
        handles.push(self.spawn_periodic(
            "describe_timeout",
            Duration::from_secs(scheduler.timeout_check_interval_secs),
            move || {
                let sweepers = Arc::clone(&sweepers);
                async move { sweepers.time_out_describe_jobs().await.map(drop) }
            },
        ));

        let sweepers = Arc::clone(&self.services.sweepers);
        handles.push(self.spawn_periodic(
            "removing_resources",
            Duration::from_secs(scheduler.removing_resources_interval_secs),
            move || {
                let sweepers = Arc::clone(&sweepers);
                async move { sweepers.complete_resource_removals().await.map(drop) }
            },
        ));

        let sweepers = Arc::clone(&self.services.sweepers);
        handles.push(self.spawn_periodic(
            "cleanup",
            Duration::from_secs(scheduler.cleanup_interval_secs),
            move || {
                let sweepers = Arc::clone(&sweepers);
                async move {
                    sweepers.cancel_disabled_integrations().await?;
                    sweepers.delete_expired().await.map(drop)
                }
            },
        ));

        handles.push(self.spawn_publisher());

        let describe_results: Arc<dyn MessageHandler> = self.services.describe_results.clone();
        handles.push(self.spawn_consumer(topics::DESCRIBE_RESULTS, describe_results));
        let runner_results: Arc<dyn MessageHandler> = self.services.runner_results.clone();
        handles.push(self.spawn_consumer(topics::RUNNER_RESULTS, runner_results));

        Ok(handles)
    }

    /// Signals every loop to stop. In-flight iterations finish first.
    pub fn stop(&self) {
        info!(instance_id = %self.instance_id, "Stopping scheduler runtime...");
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_election(&self) -> JoinHandle<()> {
        let elector = Arc::clone(&self.elector);
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(
            async move { elector.run(shutdown).await }.instrument(info_span!("leader_election")),
        )
    }

    /// Runs `task` every `period` while this instance leads.
    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, task: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = VigilResult<()>> + Send,
    {
        let leadership = self.leadership.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = ticker.tick() => {
                            if !leadership.is_leader() {
                                continue;
                            }
                            let started = Instant::now();
                            if let Err(e) = task().await {
                                error!(loop_name = name, error = %e, "Scheduler loop iteration failed");
                            }
                            SchedulerMetrics::cycle_duration(name, started.elapsed());
                        }
                    }
                }
                debug!(loop_name = name, "Scheduler loop stopped");
            }
            .instrument(info_span!("scheduler_loop", loop_name = name)),
        )
    }

    /// Invokes the runner publisher on the configured cron schedule.
    fn spawn_publisher(&self) -> JoinHandle<()> {
        let publisher = Arc::clone(&self.services.publisher);
        let schedule = self.publish_schedule.clone();
        let leadership = self.leadership.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(
            async move {
                loop {
                    let Some(next) = schedule.upcoming(Utc).next() else {
                        error!("Compliance publish schedule has no upcoming run");
                        break;
                    };
                    let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

                    tokio::select! {
                        _ = shutdown.recv() => break,
                        () = tokio::time::sleep(wait) => {
                            if !leadership.is_leader() {
                                continue;
                            }
                            let started = Instant::now();
                            if let Err(e) = publisher.publish().await {
                                error!(error = %e, "Compliance runner publish failed");
                            }
                            SchedulerMetrics::cycle_duration("runner_publish", started.elapsed());
                        }
                    }
                }
            }
            .instrument(info_span!("runner_publisher")),
        )
    }

    fn spawn_consumer(&self, topic: &'static str, handler: Arc<dyn MessageHandler>) -> JoinHandle<()> {
        let queue_config = &self.settings.queue;
        let spec = ConsumerSpec::new(
            CONSUMER_GROUP,
            self.instance_id.clone(),
            topic,
            queue_config.result_ack_wait(),
            queue_config.max_deliver,
        );
        let consumer = Consumer::new(
            Arc::clone(&self.queue),
            spec,
            queue_config.consumer_batch_size,
            queue_config.consumer_block(),
        )
        .with_heartbeat(self.settings.compliance.heartbeat_interval());
        let shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(
            async move { consumer.run(handler, shutdown).await }
            .instrument(info_span!("result_consumer", topic)),
        )
    }
}
