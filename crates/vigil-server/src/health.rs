//! Startup health checks of the job store and the work queue.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use vigil_core::{HealthCheck, HealthStatus};
use vigil_queue::WorkQueue;
use vigil_repository::DatabasePoolInterface;

pub struct JobStoreHealth {
    pool: Arc<dyn DatabasePoolInterface>,
}

impl JobStoreHealth {
    pub fn new(pool: Arc<dyn DatabasePoolInterface>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthCheck for JobStoreHealth {
    fn name(&self) -> &str {
        "job_store"
    }

    async fn check(&self) -> HealthStatus {
        match self.pool.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unhealthy(e.to_string()),
        }
    }
}

pub struct WorkQueueHealth {
    queue: Arc<dyn WorkQueue>,
}

impl WorkQueueHealth {
    pub fn new(queue: Arc<dyn WorkQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl HealthCheck for WorkQueueHealth {
    fn name(&self) -> &str {
        "work_queue"
    }

    async fn check(&self) -> HealthStatus {
        match self.queue.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unhealthy(e.to_string()),
        }
    }
}

/// Runs every check and logs the outcome. Returns the names of unhealthy components.
pub async fn run_checks(checks: &[Box<dyn HealthCheck>]) -> Vec<String> {
    let mut unhealthy = Vec::new();
    for check in checks {
        match check.check().await {
            HealthStatus::Healthy => info!(component = check.name(), "Healthy"),
            HealthStatus::Degraded(reason) => {
                warn!(component = check.name(), reason = %reason, "Degraded");
            }
            HealthStatus::Unhealthy(reason) => {
                warn!(component = check.name(), reason = %reason, "Unhealthy");
                unhealthy.push(check.name().to_string());
            }
        }
    }
    unhealthy
}
