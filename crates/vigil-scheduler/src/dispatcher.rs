//! Concurrent dispatch of admitted describe jobs.
//!
//! Every admitted job gets its own task: resolve the credential, publish,
//! record the sequence number. Tasks run fully fanned out (the ceiling is
//! applied by admission) and are joined before the cycle reports.

use crate::clients::{Integration, IntegrationClient};
use crate::metrics::{reasons, SchedulerMetrics};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use vigil_core::{DescribeJob, VigilResult};
use vigil_queue::{publish_provisioned, topics, DescribeJobMessage, StreamSpec, WorkQueue};
use vigil_repository::DescribeJobStore;
use vigil_resilience::{with_timeout, RateLimiter};

/// Deadline of one integration or credential lookup unless configured.
pub const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(120);

/// What happened to one job of a dispatch batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Published and moved to `Queued`.
    Published,
    /// Publish failed; the job was marked `Failed` for the retry sweep.
    Failed,
    /// Integration or credential unavailable; the job stays `Created`.
    Skipped,
}

/// Aggregate of one dispatch batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub published: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Published => self.published += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Publishes admitted describe jobs to the work queue.
pub struct Dispatcher {
    store: Arc<dyn DescribeJobStore>,
    queue: Arc<dyn WorkQueue>,
    integrations: Arc<dyn IntegrationClient>,
    credential_limiter: RateLimiter,
    delivery_endpoint: String,
    call_deadline: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn DescribeJobStore>,
        queue: Arc<dyn WorkQueue>,
        integrations: Arc<dyn IntegrationClient>,
        credential_limiter: RateLimiter,
        delivery_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            integrations,
            credential_limiter,
            delivery_endpoint: delivery_endpoint.into(),
            call_deadline: DEFAULT_CALL_DEADLINE,
        }
    }

    /// Bounds each integration and credential lookup.
    #[must_use]
    pub fn with_call_deadline(mut self, deadline: Duration) -> Self {
        self.call_deadline = deadline;
        self
    }

    /// Dispatches `jobs` concurrently. Per-job failures are absorbed.
    pub async fn dispatch(&self, jobs: Vec<DescribeJob>) -> DispatchReport {
        if jobs.is_empty() {
            return DispatchReport::default();
        }

        let integrations = self.load_integrations(&jobs).await;

        let outcomes = join_all(
            jobs.iter()
                .map(|job| self.dispatch_one(job, integrations.get(&job.integration_id))),
        )
        .await;

        let mut report = DispatchReport::default();
        for outcome in outcomes {
            report.record(outcome);
        }

        info!(
            published = report.published,
            failed = report.failed,
            skipped = report.skipped,
            "Describe dispatch finished"
        );
        report
    }

    /// Per-cycle integration cache keyed by integration ID.
    async fn load_integrations(&self, jobs: &[DescribeJob]) -> HashMap<String, Integration> {
        let ids: HashSet<&str> = jobs.iter().map(|j| j.integration_id.as_str()).collect();

        let lookups = join_all(ids.into_iter().map(|id| async move {
            let lookup = with_timeout("get integration", self.call_deadline, || {
                self.integrations.get_integration(id)
            })
            .await;
            (id, lookup)
        }))
        .await;

        let mut cache = HashMap::with_capacity(lookups.len());
        for (id, result) in lookups {
            match result {
                Ok(integration) => {
                    cache.insert(id.to_string(), integration);
                }
                Err(e) => {
                    warn!(integration_id = id, error = %e, "Failed to load integration for dispatch");
                }
            }
        }
        cache
    }

    async fn dispatch_one(&self, job: &DescribeJob, integration: Option<&Integration>) -> DispatchOutcome {
        let Some(integration) = integration else {
            SchedulerMetrics::dispatch_failed(reasons::GET_INTEGRATION);
            return DispatchOutcome::Skipped;
        };

        self.credential_limiter.acquire().await;
        let credential = match with_timeout("get credential", self.call_deadline, || {
            self.integrations.get_credential(&integration.credential_id)
        })
        .await
        {
            Ok(credential) => credential,
            Err(e) => {
                warn!(job_id = %job.id, integration_id = %job.integration_id, error = %e, "Failed to fetch credential");
                SchedulerMetrics::dispatch_failed(reasons::GET_CREDENTIAL);
                return DispatchOutcome::Skipped;
            }
        };

        let message = DescribeJobMessage {
            job_id: job.id,
            parent_job_id: job.parent_id,
            resource_type: job.resource_type.clone(),
            integration_id: job.integration_id.clone(),
            provider_id: job.provider_id.clone(),
            integration_type: job.integration_type.clone(),
            trigger_type: job.trigger_type,
            retry_counter: job.retry_count,
            delivery_endpoint: self.delivery_endpoint.clone(),
            cipher_text: credential.secret,
        };

        match self.publish(&message).await {
            Ok(()) => {
                SchedulerMetrics::dispatch_succeeded();
                DispatchOutcome::Published
            }
            Err(e) => {
                error!(job_id = %job.id, resource_type = %job.resource_type, error = %e, "Failed to enqueue describe job");
                SchedulerMetrics::dispatch_failed(reasons::ENQUEUE);
                if let Err(e) = self
                    .store
                    .fail_describe_job(job.id, &format!("failed to send job to queue: {e}"), true)
                    .await
                {
                    error!(job_id = %job.id, error = %e, "Failed to mark describe job failed");
                }
                DispatchOutcome::Failed
            }
        }
    }

    async fn publish(&self, message: &DescribeJobMessage) -> VigilResult<()> {
        let payload = serde_json::to_vec(message)?;
        let topic = topics::describe_jobs_for(message.trigger_type);
        let ack = publish_provisioned(
            self.queue.as_ref(),
            &[StreamSpec::describe()],
            topic,
            &payload,
            &message.dedup_key(),
        )
        .await?;

        if ack.duplicate {
            debug!(job_id = %message.job_id, seq = %ack.seq, "Publish deduplicated");
        }

        // A job that was canceled while in flight is no longer Created; the
        // message is harmless and the row keeps its state.
        if !self.store.mark_queued(message.job_id, ack.seq).await? {
            warn!(job_id = %message.job_id, seq = %ack.seq, "Describe job left Created before it was queued");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{Credential, IntegrationState, MockIntegrationClient};
    use std::time::Duration;
    use vigil_core::{DescribeJobStatus, NewDescribeJob, TriggerType, VigilError};
    use vigil_queue::InMemoryQueue;
    use vigil_repository::InMemoryJobStore;

    fn integration(id: &str) -> Integration {
        Integration {
            integration_id: id.into(),
            provider_id: "123456789012".into(),
            name: id.into(),
            integration_type: "aws_cloud_account".into(),
            state: IntegrationState::Active,
            last_check: None,
            credential_id: format!("cred-{id}"),
            labels: HashMap::new(),
        }
    }

    fn integrations_mock() -> MockIntegrationClient {
        let mut mock = MockIntegrationClient::new();
        mock.expect_get_integration()
            .returning(|id| match id {
                "i-gone" => Err(VigilError::not_found("integration", id)),
                _ => Ok(integration(id)),
            });
        mock.expect_get_credential().returning(|id| {
            Ok(Credential {
                id: id.to_string(),
                secret: format!("cipher-{id}"),
            })
        });
        mock
    }

    fn dispatcher(store: Arc<InMemoryJobStore>, queue: Arc<InMemoryQueue>) -> Dispatcher {
        Dispatcher::new(
            store,
            queue,
            Arc::new(integrations_mock()),
            RateLimiter::per_second(1000),
            "describe-delivery:443",
        )
    }

    async fn created(store: &InMemoryJobStore, integration_id: &str, rt: &str, trigger: TriggerType) -> DescribeJob {
        store
            .create_describe_job(
                &NewDescribeJob::scheduled(integration_id, "123456789012", "aws_cloud_account", rt)
                    .with_trigger(trigger),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_stores_sequence_and_queues() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueue::provisioned(&[StreamSpec::describe()]));
        let job = created(&store, "i-1", "ec2", TriggerType::Scheduled).await;

        let report = dispatcher(store.clone(), queue.clone()).dispatch(vec![job.clone()]).await;

        assert_eq!(report.published, 1);
        let stored = store.get_describe_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DescribeJobStatus::Queued);
        assert!(stored.queue_seq.is_some());

        let sent: Vec<DescribeJobMessage> = queue.decoded(topics::DESCRIBE_JOBS).unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].cipher_text, "cipher-cred-i-1");
        assert_eq!(sent[0].delivery_endpoint, "describe-delivery:443");
    }

    #[tokio::test]
    async fn test_manual_jobs_use_manual_topic() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueue::provisioned(&[StreamSpec::describe()]));
        let job = created(&store, "i-1", "ec2", TriggerType::Manual).await;

        dispatcher(store, queue.clone()).dispatch(vec![job]).await;

        assert_eq!(queue.messages(topics::DESCRIBE_JOBS_MANUALS).len(), 1);
        assert!(queue.messages(topics::DESCRIBE_JOBS).is_empty());
    }

    #[tokio::test]
    async fn test_unprovisioned_stream_is_provisioned_once() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(120)));
        let job = created(&store, "i-1", "ec2", TriggerType::Scheduled).await;

        let report = dispatcher(store, queue.clone()).dispatch(vec![job]).await;

        assert_eq!(report.published, 1);
        assert_eq!(queue.messages(topics::DESCRIBE_JOBS).len(), 1);
    }

    /// Integration service whose credential endpoint never answers.
    struct StalledCredentials;

    #[async_trait::async_trait]
    impl IntegrationClient for StalledCredentials {
        async fn list_integrations(&self) -> VigilResult<Vec<Integration>> {
            Ok(vec![])
        }

        async fn get_integration(&self, integration_id: &str) -> VigilResult<Integration> {
            Ok(integration(integration_id))
        }

        async fn health_check(&self, integration_id: &str) -> VigilResult<Integration> {
            Ok(integration(integration_id))
        }

        async fn get_credential(&self, _credential_id: &str) -> VigilResult<Credential> {
            std::future::pending().await
        }

        async fn resource_types(&self, _integration: &Integration) -> VigilResult<Vec<crate::clients::ResourceTypeInfo>> {
            Ok(vec![])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_credential_lookup_hits_deadline() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueue::provisioned(&[StreamSpec::describe()]));
        let job = created(&store, "i-1", "ec2", TriggerType::Scheduled).await;
        let dispatcher = Dispatcher::new(
            store.clone(),
            queue.clone(),
            Arc::new(StalledCredentials),
            RateLimiter::per_second(1000),
            "describe-delivery:443",
        )
        .with_call_deadline(Duration::from_secs(5));

        let report = dispatcher.dispatch(vec![job.clone()]).await;

        assert_eq!(report, DispatchReport { published: 0, failed: 0, skipped: 1 });
        assert_eq!(store.get_describe_job(job.id).await.unwrap().unwrap().status, DescribeJobStatus::Created);
        assert!(queue.messages(topics::DESCRIBE_JOBS).is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_marks_failed_without_blocking_others() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueue::provisioned(&[StreamSpec::describe()]));
        let a = created(&store, "i-1", "ec2", TriggerType::Scheduled).await;
        let b = created(&store, "i-gone", "s3", TriggerType::Scheduled).await;
        queue.reject_publishes(true);

        let report = dispatcher(store.clone(), queue).dispatch(vec![a.clone(), b.clone()]).await;

        assert_eq!(report, DispatchReport { published: 0, failed: 1, skipped: 1 });
        let a = store.get_describe_job(a.id).await.unwrap().unwrap();
        assert_eq!(a.status, DescribeJobStatus::Failed);
        assert!(a.queue_seq.is_none());
        let b = store.get_describe_job(b.id).await.unwrap().unwrap();
        assert_eq!(b.status, DescribeJobStatus::Created);
    }
}
