//! Admission control for describe jobs.
//!
//! Two gates run before a batch is dispatched:
//!
//! 1. Global ceilings: queue depth and jobs published in the trailing ten
//!    minutes. Either one over its ceiling blocks the whole batch.
//! 2. Per resource type ceilings: the batch is shuffled, then admitted
//!    greedily while `running + admitted` stays within each type's ceiling.
//!    Everything else stays `Created` for the next tick.

use crate::metrics::{reasons, SchedulerMetrics};
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};
use vigil_config::SchedulerConfig;
use vigil_core::{DescribeJob, VigilResult};
use vigil_repository::DescribeJobStore;

/// Window of the throughput ceiling.
pub const THROUGHPUT_WINDOW: chrono::Duration = chrono::Duration::minutes(10);

const QUEUE_LIMITER: &str = "cloud queued";
const THROUGHPUT_LIMITER: &str = "hour queued";

/// Which global ceiling blocked publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    QueueDepth { depth: u64, max: u64 },
    Throughput { recent: u64, max: u64 },
}

impl Blocked {
    #[must_use]
    pub const fn limiter(self) -> &'static str {
        match self {
            Self::QueueDepth { .. } => QUEUE_LIMITER,
            Self::Throughput { .. } => THROUGHPUT_LIMITER,
        }
    }
}

/// Both global ceilings as evaluated for one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ceilings {
    queue_depth: Option<Blocked>,
    throughput: Option<Blocked>,
}

impl Ceilings {
    fn evaluate(depth: u64, recent: u64, config: &SchedulerConfig) -> Self {
        Self {
            queue_depth: (depth > config.max_queued).then_some(Blocked::QueueDepth {
                depth,
                max: config.max_queued,
            }),
            throughput: (recent > config.max_in_10_minutes).then_some(Blocked::Throughput {
                recent,
                max: config.max_in_10_minutes,
            }),
        }
    }

    /// Gauge value of each limiter, set on every pass.
    fn gauges(self) -> [(&'static str, bool); 2] {
        [
            (QUEUE_LIMITER, self.queue_depth.is_some()),
            (THROUGHPUT_LIMITER, self.throughput.is_some()),
        ]
    }

    /// Queue depth wins when both ceilings are hit.
    fn blocked(self) -> Option<Blocked> {
        self.queue_depth.or(self.throughput)
    }
}

/// Candidates split by the per resource type pass.
#[derive(Debug, Default)]
pub struct Admission {
    pub admitted: Vec<DescribeJob>,
    pub deferred: Vec<DescribeJob>,
}

/// Shuffles `candidates` and admits them greedily against `ceiling`.
pub fn admit<R: Rng + ?Sized>(
    mut candidates: Vec<DescribeJob>,
    running: &HashMap<String, u64>,
    ceiling: impl Fn(&str) -> u64,
    rng: &mut R,
) -> Admission {
    candidates.shuffle(rng);

    let mut admitted_per_type: HashMap<String, u64> = HashMap::new();
    let mut admission = Admission::default();

    for job in candidates {
        let running_now = running.get(&job.resource_type).copied().unwrap_or(0);
        let admitted = admitted_per_type.entry(job.resource_type.clone()).or_insert(0);
        if running_now + *admitted + 1 > ceiling(&job.resource_type) {
            admission.deferred.push(job);
        } else {
            *admitted += 1;
            admission.admitted.push(job);
        }
    }

    admission
}

/// Store-backed admission controller.
pub struct AdmissionController {
    store: Arc<dyn DescribeJobStore>,
    config: SchedulerConfig,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn DescribeJobStore>, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    /// Checks the global ceilings and updates both blocked gauges.
    pub async fn check_ceilings(&self) -> VigilResult<Option<Blocked>> {
        let depth = self.store.count_queued_jobs().await.inspect_err(|e| {
            error!(error = %e, "Failed to count queued describe jobs");
            SchedulerMetrics::dispatch_failed(reasons::QUEUE_LENGTH);
        })?;
        let recent = self
            .store
            .count_queued_since(Utc::now() - THROUGHPUT_WINDOW)
            .await
            .inspect_err(|e| {
                error!(error = %e, "Failed to count recently queued describe jobs");
                SchedulerMetrics::dispatch_failed(reasons::LAST_HOUR_LENGTH);
            })?;

        let ceilings = Ceilings::evaluate(depth, recent, &self.config);
        for (limiter, blocked) in ceilings.gauges() {
            SchedulerMetrics::publishing_blocked(limiter, blocked);
        }
        match ceilings.blocked() {
            Some(Blocked::QueueDepth { depth, max }) => {
                warn!(depth, max, "Describe queue is full");
            }
            Some(Blocked::Throughput { recent, max }) => {
                warn!(recent, max, "Too many describe jobs in the last 10 minutes");
            }
            None => {}
        }
        Ok(ceilings.blocked())
    }

    /// Applies the per resource type ceilings to a candidate batch.
    pub async fn select(&self, candidates: Vec<DescribeJob>) -> VigilResult<Admission> {
        let running = self
            .store
            .count_running_per_resource_type()
            .await
            .inspect_err(|e| {
                error!(error = %e, "Failed to count running describe jobs per resource type");
                SchedulerMetrics::dispatch_failed(reasons::RESOURCE_TYPE_COUNT);
            })?;

        let admission = admit(
            candidates,
            &running,
            |rt| self.config.resource_type_limit(rt),
            &mut rand::rng(),
        );

        let mut deferred_per_type: HashMap<&str, u64> = HashMap::new();
        for job in &admission.deferred {
            *deferred_per_type.entry(job.resource_type.as_str()).or_default() += 1;
        }
        for (resource_type, count) in deferred_per_type {
            debug!(resource_type, count, "Deferred by resource type ceiling");
            SchedulerMetrics::jobs_deferred(resource_type, count);
        }

        Ok(admission)
    }
}
