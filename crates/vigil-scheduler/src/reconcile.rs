//! Compliance job reconciliation.
//!
//! A job leaves `RunnersInProgress` once none of its runners can still
//! change: every runner is terminal and no failed runner has retries left.

use std::sync::Arc;
use tracing::{debug, info};
use vigil_core::{ComplianceJobId, ComplianceJobStatus, VigilResult};
use vigil_repository::ComplianceStore;

pub struct ComplianceReconciler {
    store: Arc<dyn ComplianceStore>,
    max_retries: u32,
}

impl ComplianceReconciler {
    pub fn new(store: Arc<dyn ComplianceStore>, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    /// Moves the job to `SinkInProgress` when its runners are done.
    /// Returns whether the job moved.
    pub async fn reconcile(&self, job_id: ComplianceJobId) -> VigilResult<bool> {
        let Some(job) = self.store.get_compliance_job(job_id).await? else {
            return Ok(false);
        };
        if job.status != ComplianceJobStatus::RunnersInProgress {
            return Ok(false);
        }

        let unfinished = self
            .store
            .count_unfinished_runners(job_id, self.max_retries)
            .await?;
        if unfinished > 0 {
            debug!(compliance_job_id = %job_id, unfinished, "Compliance job still running");
            return Ok(false);
        }

        let moved = self
            .store
            .update_compliance_job_status(job_id, ComplianceJobStatus::SinkInProgress, None)
            .await?;
        if moved {
            info!(compliance_job_id = %job_id, framework_id = %job.framework_id, "Compliance runners finished, summarizing");
        }
        Ok(moved)
    }

    /// Reconciles every job in `RunnersInProgress`.
    pub async fn reconcile_all(&self) -> VigilResult<u64> {
        let jobs = self
            .store
            .list_compliance_jobs_by_status(ComplianceJobStatus::RunnersInProgress)
            .await?;

        let mut moved = 0;
        for job in jobs {
            if self.reconcile(job.id).await? {
                moved += 1;
            }
        }
        Ok(moved)
    }
}
