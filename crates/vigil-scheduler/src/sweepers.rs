//! Timeout and cleanup sweepers.
//!
//! Timeouts only reclaim local bookkeeping; a remote worker that reports back
//! later finds no matching attempt and its result is ignored.

use crate::clients::{IntegrationClient, InventoryClient};
use crate::metrics::SchedulerMetrics;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use vigil_config::SchedulerConfig;
use vigil_core::{DescribeJobStatus, VigilError, VigilResult};
use vigil_repository::{ComplianceStore, DescribeJobStore};
use vigil_resilience::with_timeout;

/// Removal jobs handled per pass.
const REMOVING_RESOURCES_BATCH: u32 = 100;

/// Records deleted by a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub describe_jobs: u64,
    pub compliance_jobs: u64,
}

pub struct Sweepers {
    describe_store: Arc<dyn DescribeJobStore>,
    compliance_store: Arc<dyn ComplianceStore>,
    integrations: Arc<dyn IntegrationClient>,
    inventory: Arc<dyn InventoryClient>,
    config: SchedulerConfig,
    call_deadline: Duration,
}

impl Sweepers {
    pub fn new(
        describe_store: Arc<dyn DescribeJobStore>,
        compliance_store: Arc<dyn ComplianceStore>,
        integrations: Arc<dyn IntegrationClient>,
        inventory: Arc<dyn InventoryClient>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            describe_store,
            compliance_store,
            integrations,
            inventory,
            config,
            call_deadline: crate::dispatcher::DEFAULT_CALL_DEADLINE,
        }
    }

    /// Bounds each inventory and integration service call.
    #[must_use]
    pub fn with_call_deadline(mut self, deadline: Duration) -> Self {
        self.call_deadline = deadline;
        self
    }

    /// Times out describe jobs queued or running past the describe timeout.
    pub async fn time_out_describe_jobs(&self) -> VigilResult<u64> {
        let before = Utc::now() - to_chrono(self.config.describe_timeout())?;
        let count = self.describe_store.time_out_stale_jobs(before).await?;
        if count > 0 {
            warn!(count, "Describe jobs timed out");
        }
        SchedulerMetrics::swept("describe_timeout", count);
        Ok(count)
    }

    /// Completes `RemovingResources` jobs once the inventory has dropped
    /// their resources. A failed removal is retried on the next pass.
    pub async fn complete_resource_removals(&self) -> VigilResult<u64> {
        let jobs = self
            .describe_store
            .list_removing_resources_jobs(REMOVING_RESOURCES_BATCH)
            .await?;

        let mut completed = 0;
        for job in jobs {
            if let Err(e) = with_timeout("remove resources", self.call_deadline, || {
                self.inventory
                    .remove_resources(&job.integration_id, &job.resource_type)
            })
            .await
            {
                warn!(job_id = %job.id, integration_id = %job.integration_id, resource_type = %job.resource_type, error = %e, "Failed to remove resources");
                continue;
            }

            if self
                .describe_store
                .complete_describe_job(job.id, job.retry_count, DescribeJobStatus::Succeeded, None, None)
                .await?
            {
                debug!(job_id = %job.id, "Resource removal completed");
                completed += 1;
            }
        }

        SchedulerMetrics::swept("removing_resources", completed);
        Ok(completed)
    }

    /// Cancels in-flight describe jobs of integrations that are no longer active.
    pub async fn cancel_disabled_integrations(&self) -> VigilResult<u64> {
        let integrations = with_timeout("list integrations", self.call_deadline, || {
            self.integrations.list_integrations()
        })
        .await?;

        let mut canceled = 0;
        for integration in integrations.iter().filter(|i| !i.is_active()) {
            let count = self
                .describe_store
                .cancel_jobs_for_integration(&integration.integration_id)
                .await?;
            if count > 0 {
                info!(integration_id = %integration.integration_id, count, "Canceled jobs of disabled integration");
            }
            canceled += count;
        }

        SchedulerMetrics::swept("disabled_integration", canceled);
        Ok(canceled)
    }

    /// Deletes terminal describe and compliance records past the retention window.
    pub async fn delete_expired(&self) -> VigilResult<RetentionReport> {
        let before = Utc::now() - to_chrono(self.config.retention())?;
        let report = RetentionReport {
            describe_jobs: self.describe_store.delete_jobs_older_than(before).await?,
            compliance_jobs: self
                .compliance_store
                .delete_compliance_jobs_older_than(before)
                .await?,
        };

        if report.describe_jobs + report.compliance_jobs > 0 {
            info!(
                describe_jobs = report.describe_jobs,
                compliance_jobs = report.compliance_jobs,
                "Expired records deleted"
            );
        }
        SchedulerMetrics::swept("retention", report.describe_jobs + report.compliance_jobs);
        Ok(report)
    }
}

fn to_chrono(duration: std::time::Duration) -> VigilResult<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| VigilError::internal(format!("invalid duration: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{Integration, IntegrationState, MockIntegrationClient, MockInventoryClient};
    use std::collections::HashMap;
    use vigil_core::{NewDescribeJob, SequenceNumber};
    use vigil_repository::InMemoryJobStore;

    fn sweepers(store: Arc<InMemoryJobStore>, integrations: MockIntegrationClient, inventory: MockInventoryClient) -> Sweepers {
        Sweepers::new(
            store.clone(),
            store,
            Arc::new(integrations),
            Arc::new(inventory),
            SchedulerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_stale_queued_job_times_out_then_retries() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = store
            .create_describe_job(&NewDescribeJob::scheduled("i-1", "p", "aws_cloud_account", "ec2"))
            .await
            .unwrap();
        store.mark_queued(job.id, SequenceNumber(3)).await.unwrap();
        store.set_describe_job_updated_at(job.id, Utc::now() - chrono::Duration::hours(5));

        let s = sweepers(store.clone(), MockIntegrationClient::new(), MockInventoryClient::new());
        assert_eq!(s.time_out_describe_jobs().await.unwrap(), 1);
        assert_eq!(
            store.get_describe_job(job.id).await.unwrap().unwrap().status,
            DescribeJobStatus::TimedOut
        );

        let sweep = store.retry_failed_jobs(3).await.unwrap();
        assert_eq!(sweep.retried, 1);
        let retried = store.get_describe_job(job.id).await.unwrap().unwrap();
        assert_eq!(retried.status, DescribeJobStatus::Created);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.queue_seq.is_none());
    }

    #[tokio::test]
    async fn test_resource_removal_completes_on_success_only() {
        let store = Arc::new(InMemoryJobStore::new());
        let ok = store
            .create_describe_job(
                &NewDescribeJob::scheduled("i-1", "p", "aws_cloud_account", "ec2")
                    .with_status(DescribeJobStatus::RemovingResources),
            )
            .await
            .unwrap();
        let failing = store
            .create_describe_job(
                &NewDescribeJob::scheduled("i-2", "p", "aws_cloud_account", "ec2")
                    .with_status(DescribeJobStatus::RemovingResources),
            )
            .await
            .unwrap();

        let mut inventory = MockInventoryClient::new();
        inventory.expect_remove_resources().returning(|integration_id, _| {
            if integration_id == "i-2" {
                Err(VigilError::external("inventory", "timeout"))
            } else {
                Ok(())
            }
        });

        let s = sweepers(store.clone(), MockIntegrationClient::new(), inventory);
        assert_eq!(s.complete_resource_removals().await.unwrap(), 1);

        assert_eq!(store.get_describe_job(ok.id).await.unwrap().unwrap().status, DescribeJobStatus::Succeeded);
        assert_eq!(
            store.get_describe_job(failing.id).await.unwrap().unwrap().status,
            DescribeJobStatus::RemovingResources
        );
    }

    #[tokio::test]
    async fn test_disabled_integration_jobs_are_canceled() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = store
            .create_describe_job(&NewDescribeJob::scheduled("i-off", "p", "aws_cloud_account", "ec2"))
            .await
            .unwrap();
        let kept = store
            .create_describe_job(&NewDescribeJob::scheduled("i-on", "p", "aws_cloud_account", "ec2"))
            .await
            .unwrap();

        let mut integrations = MockIntegrationClient::new();
        integrations.expect_list_integrations().returning(|| {
            Ok(["i-off", "i-on"]
                .into_iter()
                .map(|id| Integration {
                    integration_id: id.into(),
                    provider_id: "p".into(),
                    name: id.into(),
                    integration_type: "aws_cloud_account".into(),
                    state: if id == "i-off" { IntegrationState::Inactive } else { IntegrationState::Active },
                    last_check: None,
                    credential_id: String::new(),
                    labels: HashMap::new(),
                })
                .collect())
        });

        let s = sweepers(store.clone(), integrations, MockInventoryClient::new());
        assert_eq!(s.cancel_disabled_integrations().await.unwrap(), 1);
        assert_eq!(store.get_describe_job(job.id).await.unwrap().unwrap().status, DescribeJobStatus::Canceled);
        assert_eq!(store.get_describe_job(kept.id).await.unwrap().unwrap().status, DescribeJobStatus::Created);
    }

    #[tokio::test]
    async fn test_retention_deletes_only_old_terminal_jobs() {
        let store = Arc::new(InMemoryJobStore::new());
        let old = store
            .create_describe_job(&NewDescribeJob::scheduled("i-1", "p", "aws_cloud_account", "ec2"))
            .await
            .unwrap();
        store.fail_describe_job(old.id, "boom", false).await.unwrap();
        store.set_describe_job_updated_at(old.id, Utc::now() - chrono::Duration::days(8));
        let fresh = store
            .create_describe_job(&NewDescribeJob::scheduled("i-1", "p", "aws_cloud_account", "s3"))
            .await
            .unwrap();

        let s = sweepers(store.clone(), MockIntegrationClient::new(), MockInventoryClient::new());
        let report = s.delete_expired().await.unwrap();

        assert_eq!(report.describe_jobs, 1);
        assert!(store.get_describe_job(old.id).await.unwrap().is_none());
        assert!(store.get_describe_job(fresh.id).await.unwrap().is_some());
    }
}
