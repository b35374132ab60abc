//! Compliance runner publisher.
//!
//! One invocation drains the `Created` runner backlog in up to
//! `inner_iterations` rounds. Each round reclaims timed out runners, fetches
//! a bounded batch per lane and publishes it. The query catalog and the
//! connection list are loaded once per invocation.

use crate::clients::{ComplianceClient, Integration, IntegrationClient};
use crate::metrics::{reasons, SchedulerMetrics};
use crate::reconcile::ComplianceReconciler;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use vigil_config::ComplianceConfig;
use vigil_core::{
    ComplianceJobId, ComplianceRunner, Lane, QueryDefinition, RunnerRecord, VigilError,
    VigilResult,
};
use vigil_queue::{
    publish_provisioned, topics, ExecutionPlan, RunnerJobMessage, StreamSpec, WorkQueue,
};
use vigil_repository::ComplianceStore;

/// Counters of one publisher invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub retried: u64,
    pub exhausted: u64,
}

/// Catalogs resolved once per invocation.
struct Catalogs {
    queries: HashMap<String, QueryDefinition>,
    connections: HashMap<String, Integration>,
}

pub struct RunnerPublisher {
    store: Arc<dyn ComplianceStore>,
    queue: Arc<dyn WorkQueue>,
    compliance: Arc<dyn ComplianceClient>,
    integrations: Arc<dyn IntegrationClient>,
    reconciler: ComplianceReconciler,
    stream: StreamSpec,
    config: ComplianceConfig,
    max_retries: u32,
}

impl RunnerPublisher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ComplianceStore>,
        queue: Arc<dyn WorkQueue>,
        compliance: Arc<dyn ComplianceClient>,
        integrations: Arc<dyn IntegrationClient>,
        stream: StreamSpec,
        config: ComplianceConfig,
        max_retries: u32,
    ) -> Self {
        Self {
            reconciler: ComplianceReconciler::new(Arc::clone(&store), max_retries),
            store,
            queue,
            compliance,
            integrations,
            stream,
            config,
            max_retries,
        }
    }

    /// One publisher invocation.
    #[instrument(skip(self))]
    pub async fn publish(&self) -> VigilResult<PublishReport> {
        let catalogs = self.load_catalogs().await?;
        let mut report = PublishReport::default();
        let mut touched_jobs = BTreeSet::new();

        for iteration in 0..self.config.inner_iterations {
            report.timed_out += self.time_out_runners().await?;

            let mut records = self
                .store
                .fetch_created_runners(self.config.batch_size, Lane::Manual)
                .await?;
            records.extend(
                self.store
                    .fetch_created_runners(self.config.batch_size, Lane::Scheduled)
                    .await?,
            );
            if records.is_empty() {
                debug!(iteration, "No created runners left");
                break;
            }

            for record in &records {
                match self.publish_record(record, &catalogs).await {
                    Ok(Some(job_id)) => {
                        report.published += 1;
                        touched_jobs.insert(job_id);
                    }
                    Ok(None) => report.failed += 1,
                    Err(e) => {
                        error!(runner_id = %record.id(), error = %e, "Failed to record runner publish outcome");
                        report.failed += 1;
                    }
                }
            }
        }

        for job_id in touched_jobs {
            if self.store.count_created_runners(job_id).await? == 0 {
                self.store.set_all_runners_queued(job_id).await?;
            }
        }

        let sweep = self.store.retry_failed_runners(self.max_retries).await?;
        report.retried = sweep.retried;
        report.exhausted = sweep.exhausted;

        // Runners failed for good above may have been the last ones of a job.
        self.reconciler.reconcile_all().await?;

        info!(
            published = report.published,
            failed = report.failed,
            timed_out = report.timed_out,
            retried = report.retried,
            exhausted = report.exhausted,
            "Compliance runner publish finished"
        );
        Ok(report)
    }

    async fn load_catalogs(&self) -> VigilResult<Catalogs> {
        let queries = self
            .compliance
            .list_queries()
            .await?
            .into_iter()
            .map(|q| (q.id.clone(), q))
            .collect();
        let connections = self
            .integrations
            .list_integrations()
            .await?
            .into_iter()
            .map(|i| (i.integration_id.clone(), i))
            .collect();
        Ok(Catalogs { queries, connections })
    }

    async fn time_out_runners(&self) -> VigilResult<u64> {
        let now = Utc::now();
        let queued_before = now - chrono_duration(self.config.queued_timeout())?;
        let in_progress_before = now - chrono_duration(self.config.in_progress_timeout())?;

        let queued = self.store.time_out_queued_runners(queued_before).await?;
        let in_progress = self
            .store
            .time_out_in_progress_runners(in_progress_before)
            .await?;
        if queued + in_progress > 0 {
            warn!(queued, in_progress, "Compliance runners timed out");
        }
        SchedulerMetrics::swept("runner_timeout", queued + in_progress);
        Ok(queued + in_progress)
    }

    /// Publishes one record. `Ok(None)` means the runner was failed instead.
    async fn publish_record(
        &self,
        record: &RunnerRecord,
        catalogs: &Catalogs,
    ) -> VigilResult<Option<ComplianceJobId>> {
        let runner = match record {
            RunnerRecord::Valid(runner) => runner,
            RunnerRecord::Malformed { id, reason, .. } => {
                warn!(runner_id = %id, reason = %reason, "Malformed compliance runner");
                SchedulerMetrics::runner_failed(reasons::MALFORMED);
                self.store.fail_runner(*id, reason, false).await?;
                return Ok(None);
            }
        };

        let plan = match self.execution_plan(runner, catalogs) {
            Ok(plan) => plan,
            Err((reason, e)) => {
                warn!(runner_id = %runner.id, runner = %runner.identity_key(), error = %e, "Compliance runner cannot be published");
                SchedulerMetrics::runner_failed(reason);
                self.store.fail_runner(runner.id, &e.to_string(), false).await?;
                return Ok(None);
            }
        };

        let message = RunnerJobMessage {
            id: runner.id,
            retry_count: runner.retry_count,
            parent_job_id: runner.parent_job_id,
            created_at: runner.created_at,
            execution_plan: plan,
        };

        match self.send(&message, runner).await {
            Ok(true) => {
                SchedulerMetrics::runner_published();
                Ok(Some(runner.parent_job_id))
            }
            Ok(false) => Ok(None),
            Err(e) => {
                error!(runner_id = %runner.id, error = %e, "Failed to enqueue compliance runner");
                SchedulerMetrics::runner_failed(reasons::ENQUEUE);
                self.store
                    .fail_runner(runner.id, &format!("failed to send runner to queue: {e}"), true)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Resolves the query and the connection. Both failures are permanent.
    fn execution_plan(
        &self,
        runner: &ComplianceRunner,
        catalogs: &Catalogs,
    ) -> Result<ExecutionPlan, (&'static str, VigilError)> {
        let query = catalogs.queries.get(&runner.query_id).cloned().ok_or_else(|| {
            (
                reasons::QUERY_NOT_FOUND,
                VigilError::data_integrity(format!("query {} not found", runner.query_id)),
            )
        })?;

        let provider_id = match &runner.integration_id {
            Some(integration_id) => {
                let connection = catalogs.connections.get(integration_id).ok_or_else(|| {
                    (
                        reasons::CONNECTION_NOT_FOUND,
                        VigilError::data_integrity(format!("connection {integration_id} not found")),
                    )
                })?;
                Some(connection.provider_id.clone())
            }
            None => None,
        };

        Ok(ExecutionPlan {
            callers: runner.callers.clone(),
            query,
            integration_id: runner.integration_id.clone(),
            provider_id,
        })
    }

    async fn send(&self, message: &RunnerJobMessage, runner: &ComplianceRunner) -> VigilResult<bool> {
        let payload = serde_json::to_vec(message)?;
        let ack = publish_provisioned(
            self.queue.as_ref(),
            std::slice::from_ref(&self.stream),
            topics::runner_jobs_for(runner.trigger_type),
            &payload,
            &message.dedup_key(),
        )
        .await?;

        let queued = self.store.mark_runner_queued(runner.id, ack.seq).await?;
        if !queued {
            warn!(runner_id = %runner.id, seq = %ack.seq, "Runner left Created before it was queued");
        }
        Ok(queued)
    }
}

fn chrono_duration(duration: std::time::Duration) -> VigilResult<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| VigilError::internal(format!("invalid duration: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{IntegrationState, MockComplianceClient, MockIntegrationClient};
    use vigil_core::{
        Caller, ComplianceJobStatus, NewComplianceJob, NewComplianceRunner, RunnerId,
        RunnerStatus, TriggerType,
    };
    use vigil_queue::InMemoryQueue;
    use vigil_repository::InMemoryJobStore;

    fn query(id: &str) -> QueryDefinition {
        QueryDefinition {
            id: id.into(),
            query_to_execute: "select arn as resource, 'ok' as status from aws_s3_bucket".into(),
            engine: "sql".into(),
            primary_table: Some("aws_s3_bucket".into()),
            list_of_tables: vec!["aws_s3_bucket".into()],
            parameters: vec![],
            integration_types: vec!["aws_cloud_account".into()],
        }
    }

    fn compliance_mock() -> MockComplianceClient {
        let mut mock = MockComplianceClient::new();
        mock.expect_list_queries()
            .returning(|| Ok(vec![query("q-1"), query("q-2")]));
        mock
    }

    fn integrations_mock() -> MockIntegrationClient {
        let mut mock = MockIntegrationClient::new();
        mock.expect_list_integrations().returning(|| {
            Ok(vec![Integration {
                integration_id: "i-1".into(),
                provider_id: "123456789012".into(),
                name: "prod".into(),
                integration_type: "aws_cloud_account".into(),
                state: IntegrationState::Active,
                last_check: None,
                credential_id: "cred-1".into(),
                labels: HashMap::new(),
            }])
        });
        mock
    }

    fn stream() -> StreamSpec {
        StreamSpec::compliance_runner(1_000)
    }

    fn publisher(store: Arc<InMemoryJobStore>, queue: Arc<InMemoryQueue>) -> RunnerPublisher {
        RunnerPublisher::new(
            store,
            queue,
            Arc::new(compliance_mock()),
            Arc::new(integrations_mock()),
            stream(),
            ComplianceConfig::default(),
            3,
        )
    }

    async fn runner(store: &InMemoryJobStore, query_id: &str, integration: &str, trigger: TriggerType) -> (ComplianceJobId, RunnerId) {
        let job = store
            .create_compliance_job(&NewComplianceJob {
                framework_id: "cis_v2".into(),
                integration_ids: vec![integration.into()],
                with_incidents: false,
                include_results: vec![],
                trigger_type: trigger,
                parent_id: None,
                created_by: "system".into(),
            })
            .await
            .unwrap();
        store
            .update_compliance_job_status(job.id, ComplianceJobStatus::RunnersInProgress, None)
            .await
            .unwrap();
        let ids = store
            .create_runners(&[NewComplianceRunner {
                parent_job_id: job.id,
                framework_id: "cis_v2".into(),
                query_id: query_id.into(),
                integration_id: Some(integration.into()),
                resource_collection_id: None,
                callers: vec![
                    Caller::new("cis_v2", "cis_2_1_1", "high"),
                    Caller::new("soc2", "cc_6_1", "medium"),
                ],
                trigger_type: trigger,
            }])
            .await
            .unwrap();
        (job.id, ids[0])
    }

    fn status(store: &InMemoryJobStore, id: RunnerId) -> ComplianceRunner {
        store.runners().into_iter().find(|r| r.id == id).unwrap()
    }

    #[tokio::test]
    async fn test_publishes_and_queues() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueue::provisioned(&[stream()]));
        let (job_id, id) = runner(&store, "q-1", "i-1", TriggerType::Scheduled).await;

        let report = publisher(store.clone(), queue.clone()).publish().await.unwrap();

        assert_eq!(report.published, 1);
        let stored = status(&store, id);
        assert_eq!(stored.status, RunnerStatus::Queued);
        assert!(stored.queue_seq.is_some());

        let sent: Vec<RunnerJobMessage> = queue.decoded(topics::RUNNER_JOBS).unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].execution_plan.callers.len(), 2);
        assert_eq!(sent[0].execution_plan.provider_id.as_deref(), Some("123456789012"));
        assert_eq!(sent[0].dedup_key(), format!("job-{id}-0"));

        let job = store.get_compliance_job(job_id).await.unwrap().unwrap();
        assert!(job.are_all_runners_queued);
    }

    #[tokio::test]
    async fn test_manual_runner_uses_manual_topic() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueue::provisioned(&[stream()]));
        runner(&store, "q-1", "i-1", TriggerType::Manual).await;

        publisher(store, queue.clone()).publish().await.unwrap();

        assert_eq!(queue.messages(topics::RUNNER_JOBS_MANUALS).len(), 1);
        assert!(queue.messages(topics::RUNNER_JOBS).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_query_fails_without_retry() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueue::provisioned(&[stream()]));
        let (_, id) = runner(&store, "q-missing", "i-1", TriggerType::Scheduled).await;
        let publisher = publisher(store.clone(), queue.clone());

        let report = publisher.publish().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 0);

        let stored = status(&store, id);
        assert_eq!(stored.status, RunnerStatus::Failed);
        assert!(!stored.retryable);

        // Later invocations neither retry nor republish it.
        publisher.publish().await.unwrap();
        assert_eq!(status(&store, id).status, RunnerStatus::Failed);
        assert!(store.fetch_created_runners(100, Lane::Scheduled).await.unwrap().is_empty());
        assert!(queue.messages(topics::RUNNER_JOBS).is_empty());
    }

    #[tokio::test]
    async fn test_missing_connection_fails_without_retry() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueue::provisioned(&[stream()]));
        let (_, id) = runner(&store, "q-1", "i-deleted", TriggerType::Scheduled).await;

        publisher(store.clone(), queue).publish().await.unwrap();

        let stored = status(&store, id);
        assert_eq!(stored.status, RunnerStatus::Failed);
        assert!(!stored.retryable);
    }

    #[tokio::test]
    async fn test_malformed_runner_is_failed() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueue::provisioned(&[stream()]));
        store.insert_malformed_runner("failed to parse callers");

        let report = publisher(store.clone(), queue).publish().await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(store.fetch_created_runners(100, Lane::Scheduled).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_runner_is_republished_with_next_retry() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueue::provisioned(&[stream()]));
        let (_, id) = runner(&store, "q-1", "i-1", TriggerType::Scheduled).await;
        let publisher = publisher(store.clone(), queue.clone());

        publisher.publish().await.unwrap();
        assert_eq!(status(&store, id).status, RunnerStatus::Queued);

        // No heartbeat for longer than the queued timeout.
        store.set_runner_timestamps(id, Utc::now() - chrono::Duration::hours(2));
        let report = publisher.publish().await.unwrap();
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(status(&store, id).status, RunnerStatus::Created);
        assert_eq!(status(&store, id).retry_count, 1);

        publisher.publish().await.unwrap();

        let sent: Vec<RunnerJobMessage> = queue.decoded(topics::RUNNER_JOBS).unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].retry_count, 1);
        assert_ne!(sent[0].dedup_key(), sent[1].dedup_key());
        assert_eq!(status(&store, id).status, RunnerStatus::Queued);
    }

    #[tokio::test]
    async fn test_rejected_publish_fails_runner_for_retry() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = Arc::new(InMemoryQueue::provisioned(&[stream()]));
        queue.reject_publishes(true);
        let (_, id) = runner(&store, "q-1", "i-1", TriggerType::Scheduled).await;

        let report = publisher(store.clone(), queue).publish().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 1);
        let stored = status(&store, id);
        assert_eq!(stored.status, RunnerStatus::Created);
        assert_eq!(stored.retry_count, 1);
    }
}
