//! Result consumers.
//!
//! Workers report progress and final results on the results topics. The
//! handlers below apply them to the job store:
//!
//! - undecodable payload: dropped, never retried
//! - status a worker may not report (`CREATED`, `QUEUED`, ...): dropped
//! - store failure: nak, the message is redelivered
//! - result for an attempt the store no longer tracks: acknowledged and ignored
//!
//! A runner's status is recorded before its findings are sunk, so a failed
//! store write never leaves findings downstream for a result that will be
//! redelivered.

use crate::clients::ResultSink;
use crate::fanout::{fan_out_results, BenchmarkCache};
use crate::metrics::SchedulerMetrics;
use crate::reconcile::ComplianceReconciler;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use vigil_core::{DescribeJobStatus, RunnerRecord, RunnerStatus, VigilResult};
use vigil_queue::{
    decode, Delivery, DescribeResultMessage, Disposition, MessageHandler, RunnerResultMessage,
};
use vigil_repository::{ComplianceStore, DescribeJobStore};

const DESCRIBE: &str = "describe";
const RUNNER: &str = "compliance_runner";

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

/// Converts a store outcome into a disposition.
fn settle(family: &'static str, result: VigilResult<bool>) -> Disposition {
    match result {
        Ok(true) => {
            SchedulerMetrics::result_processed(family, "applied");
            Disposition::Ack
        }
        Ok(false) => {
            SchedulerMetrics::result_processed(family, "stale");
            Disposition::Ack
        }
        Err(e) => {
            error!(family, error = %e, "Failed to apply result");
            SchedulerMetrics::result_processed(family, "error");
            Disposition::Nak
        }
    }
}

// ============================================================================
// Describe results
// ============================================================================

pub struct DescribeResultHandler {
    store: Arc<dyn DescribeJobStore>,
}

impl DescribeResultHandler {
    pub fn new(store: Arc<dyn DescribeJobStore>) -> Self {
        Self { store }
    }

    async fn apply(&self, result: &DescribeResultMessage) -> VigilResult<bool> {
        let retry = result.retry_count();
        let applied = if result.status == DescribeJobStatus::InProgress {
            self.store.mark_in_progress(result.job_id, retry).await?
        } else {
            self.store
                .complete_describe_job(
                    result.job_id,
                    retry,
                    result.status,
                    non_empty(&result.error),
                    non_empty(&result.error_code),
                )
                .await?
        };

        if applied {
            debug!(job_id = %result.job_id, status = %result.status, resources = result.described_resource_ids.len(), "Describe result applied");
        } else {
            debug!(job_id = %result.job_id, retry, status = %result.status, "Ignoring result for a stale attempt");
        }
        Ok(applied)
    }
}

#[async_trait]
impl MessageHandler for DescribeResultHandler {
    async fn handle(&self, delivery: &Delivery) -> Disposition {
        let result: DescribeResultMessage = match decode(delivery) {
            Ok(result) => result,
            Err(e) => {
                warn!(seq = %delivery.seq, error = %e, "Undecodable describe result");
                SchedulerMetrics::result_processed(DESCRIBE, "malformed");
                return Disposition::Drop;
            }
        };
        if !result.status.is_worker_reported() {
            warn!(job_id = %result.job_id, status = %result.status, "Rejecting describe result with a scheduler-owned status");
            SchedulerMetrics::result_processed(DESCRIBE, "rejected");
            return Disposition::Drop;
        }
        settle(DESCRIBE, self.apply(&result).await)
    }
}

// ============================================================================
// Compliance runner results
// ============================================================================

pub struct RunnerResultHandler {
    store: Arc<dyn ComplianceStore>,
    sink: Arc<dyn ResultSink>,
    benchmarks: Arc<BenchmarkCache>,
    reconciler: ComplianceReconciler,
}

impl RunnerResultHandler {
    pub fn new(
        store: Arc<dyn ComplianceStore>,
        sink: Arc<dyn ResultSink>,
        benchmarks: Arc<BenchmarkCache>,
        max_retries: u32,
    ) -> Self {
        Self {
            reconciler: ComplianceReconciler::new(Arc::clone(&store), max_retries),
            store,
            sink,
            benchmarks,
        }
    }

    /// True when this attempt is already recorded as succeeded: the result
    /// is a redelivery whose findings did not reach the sink.
    async fn is_recorded_success(&self, result: &RunnerResultMessage) -> VigilResult<bool> {
        Ok(match self.store.get_runner(result.job.id).await? {
            Some(RunnerRecord::Valid(runner)) => {
                runner.retry_count == result.job.retry_count
                    && runner.status == RunnerStatus::Succeeded
            }
            _ => false,
        })
    }

    /// Sends the fanned-out findings downstream.
    async fn sink_findings(&self, result: &RunnerResultMessage) -> VigilResult<()> {
        let callers = &result.job.execution_plan.callers;
        let codes = self
            .benchmarks
            .reference_codes(callers.iter().map(|c| c.root_benchmark.as_str()))
            .await?;
        let records = fan_out_results(&result.job, &result.findings, &codes, Utc::now());
        if records.is_empty() {
            return Ok(());
        }
        self.sink.ingest(&records).await?;
        debug!(runner_id = %result.job.id, records = records.len(), "Compliance results sunk");
        Ok(())
    }

    async fn apply(&self, result: &RunnerResultMessage) -> VigilResult<bool> {
        let id = result.job.id;
        let retry = result.job.retry_count;

        if result.status == RunnerStatus::InProgress {
            return self.store.mark_runner_in_progress(id, retry).await;
        }

        let recorded = self
            .store
            .complete_runner(
                id,
                retry,
                result.status,
                non_empty(&result.error),
                result.total_finding_count,
            )
            .await?;

        let owes_sink = result.status == RunnerStatus::Succeeded && !result.findings.is_empty();
        if !recorded && !(owes_sink && self.is_recorded_success(result).await?) {
            debug!(runner_id = %id, retry, status = %result.status, "Ignoring result for a stale attempt");
            return Ok(false);
        }

        if recorded {
            info!(runner_id = %id, status = %result.status, findings = ?result.total_finding_count, "Compliance runner finished");
        }
        if owes_sink {
            self.sink_findings(result).await?;
        }
        self.reconciler.reconcile(result.job.parent_job_id).await?;
        Ok(true)
    }
}

#[async_trait]
impl MessageHandler for RunnerResultHandler {
    async fn handle(&self, delivery: &Delivery) -> Disposition {
        let result: RunnerResultMessage = match decode(delivery) {
            Ok(result) => result,
            Err(e) => {
                warn!(seq = %delivery.seq, error = %e, "Undecodable compliance runner result");
                SchedulerMetrics::result_processed(RUNNER, "malformed");
                return Disposition::Drop;
            }
        };
        if !result.status.is_worker_reported() {
            warn!(runner_id = %result.job.id, status = %result.status, "Rejecting compliance runner result with a scheduler-owned status");
            SchedulerMetrics::result_processed(RUNNER, "rejected");
            return Disposition::Drop;
        }
        settle(RUNNER, self.apply(&result).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{Benchmark, MockComplianceClient, MockResultSink};
    use vigil_core::{
        Caller, ComplianceJobStatus, DescribeJobId, NewComplianceJob, NewComplianceRunner,
        NewDescribeJob, QueryDefinition, RunnerId, SequenceNumber, TriggerType, VigilError,
    };
    use vigil_queue::{DescribeJobMessage, ExecutionPlan, FindingStatus, RunnerFinding, RunnerJobMessage};
    use vigil_repository::InMemoryJobStore;

    fn delivery<T: serde::Serialize>(message: &T) -> Delivery {
        Delivery {
            topic: "results".into(),
            entry_id: "1-0".into(),
            seq: SequenceNumber(1),
            payload: serde_json::to_vec(message).unwrap(),
            delivery_count: 1,
        }
    }

    fn describe_result(id: DescribeJobId, retry: u32, status: DescribeJobStatus) -> DescribeResultMessage {
        DescribeResultMessage {
            job_id: id,
            parent_job_id: None,
            status,
            error: if status == DescribeJobStatus::Failed { "access denied".into() } else { String::new() },
            error_code: String::new(),
            describe_job: DescribeJobMessage {
                job_id: id,
                parent_job_id: None,
                resource_type: "ec2".into(),
                integration_id: "i-1".into(),
                provider_id: "123456789012".into(),
                integration_type: "aws_cloud_account".into(),
                trigger_type: TriggerType::Scheduled,
                retry_counter: retry,
                delivery_endpoint: "delivery".into(),
                cipher_text: "cipher".into(),
            },
            described_resource_ids: vec!["i-0abc".into()],
        }
    }

    async fn queued_describe_job(store: &InMemoryJobStore) -> DescribeJobId {
        let job = store
            .create_describe_job(&NewDescribeJob::scheduled("i-1", "123456789012", "aws_cloud_account", "ec2"))
            .await
            .unwrap();
        store.mark_queued(job.id, SequenceNumber(1)).await.unwrap();
        job.id
    }

    #[tokio::test]
    async fn test_describe_progress_then_success() {
        let store = Arc::new(InMemoryJobStore::new());
        let id = queued_describe_job(&store).await;
        let handler = DescribeResultHandler::new(store.clone());

        let progress = delivery(&describe_result(id, 0, DescribeJobStatus::InProgress));
        assert_eq!(handler.handle(&progress).await, Disposition::Ack);
        let done = delivery(&describe_result(id, 0, DescribeJobStatus::Succeeded));
        assert_eq!(handler.handle(&done).await, Disposition::Ack);

        let job = store.get_describe_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, DescribeJobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_describe_failure_records_message() {
        let store = Arc::new(InMemoryJobStore::new());
        let id = queued_describe_job(&store).await;
        let handler = DescribeResultHandler::new(store.clone());

        handler.handle(&delivery(&describe_result(id, 0, DescribeJobStatus::Failed))).await;

        let job = store.get_describe_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, DescribeJobStatus::Failed);
        assert_eq!(job.failure_message.as_deref(), Some("access denied"));
    }

    #[tokio::test]
    async fn test_stale_attempt_is_acked_and_ignored() {
        let store = Arc::new(InMemoryJobStore::new());
        let id = queued_describe_job(&store).await;
        let handler = DescribeResultHandler::new(store.clone());

        let old = delivery(&describe_result(id, 4, DescribeJobStatus::Succeeded));
        assert_eq!(handler.handle(&old).await, Disposition::Ack);
        assert_eq!(store.get_describe_job(id).await.unwrap().unwrap().status, DescribeJobStatus::Queued);
    }

    #[tokio::test]
    async fn test_scheduler_owned_describe_status_is_dropped() {
        let store = Arc::new(InMemoryJobStore::new());
        let id = queued_describe_job(&store).await;
        store.fail_describe_job(id, "permanent", false).await.unwrap();
        let handler = DescribeResultHandler::new(store.clone());

        for status in [DescribeJobStatus::Created, DescribeJobStatus::Queued] {
            let result = delivery(&describe_result(id, 0, status));
            assert_eq!(handler.handle(&result).await, Disposition::Drop);
        }

        let job = store.get_describe_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, DescribeJobStatus::Failed);
        assert!(!job.retryable);
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let handler = DescribeResultHandler::new(Arc::new(InMemoryJobStore::new()));
        let garbage = Delivery {
            topic: "results".into(),
            entry_id: "1-0".into(),
            seq: SequenceNumber(1),
            payload: b"{not json".to_vec(),
            delivery_count: 1,
        };
        assert_eq!(handler.handle(&garbage).await, Disposition::Drop);
    }

    #[tokio::test]
    async fn test_store_failure_naks() {
        let store = Arc::new(InMemoryJobStore::new());
        let id = queued_describe_job(&store).await;
        store.set_unavailable(true);
        let handler = DescribeResultHandler::new(store.clone());

        let result = delivery(&describe_result(id, 0, DescribeJobStatus::InProgress));
        assert_eq!(handler.handle(&result).await, Disposition::Nak);
    }

    struct RunnerFixture {
        store: Arc<InMemoryJobStore>,
        job_id: vigil_core::ComplianceJobId,
        runner_id: RunnerId,
    }

    async fn queued_runner() -> RunnerFixture {
        let store = Arc::new(InMemoryJobStore::new());
        let job = store
            .create_compliance_job(&NewComplianceJob {
                framework_id: "cis_v2".into(),
                integration_ids: vec!["i-1".into()],
                with_incidents: true,
                include_results: vec![],
                trigger_type: TriggerType::Scheduled,
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
                query_id: "q-1".into(),
                integration_id: Some("i-1".into()),
                resource_collection_id: None,
                callers: callers(),
                trigger_type: TriggerType::Scheduled,
            }])
            .await
            .unwrap();
        store.mark_runner_queued(ids[0], SequenceNumber(7)).await.unwrap();
        RunnerFixture {
            store,
            job_id: job.id,
            runner_id: ids[0],
        }
    }

    fn callers() -> Vec<Caller> {
        vec![
            Caller::new("cis_v2", "cis_1_1", "high"),
            Caller::new("soc2", "cc_6_1", "medium"),
        ]
    }

    fn runner_result(fixture: &RunnerFixture, status: RunnerStatus, findings: Vec<RunnerFinding>) -> RunnerResultMessage {
        RunnerResultMessage {
            job: RunnerJobMessage {
                id: fixture.runner_id,
                retry_count: 0,
                parent_job_id: fixture.job_id,
                created_at: Utc::now(),
                execution_plan: ExecutionPlan {
                    callers: callers(),
                    query: QueryDefinition {
                        id: "q-1".into(),
                        query_to_execute: "select 1".into(),
                        engine: "sql".into(),
                        primary_table: None,
                        list_of_tables: vec![],
                        parameters: vec![],
                        integration_types: vec![],
                    },
                    integration_id: Some("i-1".into()),
                    provider_id: Some("123456789012".into()),
                },
            },
            started_at: Some(Utc::now()),
            status,
            error: String::new(),
            total_finding_count: Some(findings.len() as i64),
            findings,
        }
    }

    fn finding(id: &str, status: FindingStatus) -> RunnerFinding {
        RunnerFinding {
            resource_id: id.into(),
            resource_name: id.into(),
            resource_type: "aws::s3::bucket".into(),
            resource_location: "us-east-1".into(),
            integration_id: None,
            status,
            reason: String::new(),
        }
    }

    fn benchmarks() -> Arc<BenchmarkCache> {
        let mut client = MockComplianceClient::new();
        client.expect_list_benchmarks().returning(|| {
            Ok(vec![
                Benchmark { id: "cis_v2".into(), reference_code: "CIS-2.0".into() },
                Benchmark { id: "soc2".into(), reference_code: "SOC2".into() },
            ])
        });
        Arc::new(BenchmarkCache::new(Arc::new(client)))
    }

    #[tokio::test]
    async fn test_succeeded_runner_fans_out_and_reconciles() {
        let fixture = queued_runner().await;
        let mut sink = MockResultSink::new();
        sink.expect_ingest()
            .withf(|records| {
                records.len() == 4
                    && records.iter().any(|r| r.benchmark_reference_code == "CIS-2.0")
                    && records.iter().any(|r| r.benchmark_reference_code == "SOC2")
            })
            .times(1)
            .returning(|_| Ok(()));
        let handler = RunnerResultHandler::new(fixture.store.clone(), Arc::new(sink), benchmarks(), 3);

        let result = runner_result(
            &fixture,
            RunnerStatus::Succeeded,
            vec![
                finding("bucket-a", FindingStatus::Alarm),
                finding("bucket-b", FindingStatus::Ok),
                finding("bucket-c", FindingStatus::Skip),
            ],
        );
        assert_eq!(handler.handle(&delivery(&result)).await, Disposition::Ack);

        let runner = fixture.store.runners().pop().unwrap();
        assert_eq!(runner.status, RunnerStatus::Succeeded);
        assert_eq!(runner.total_finding_count, Some(3));
        let job = fixture.store.get_compliance_job(fixture.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, ComplianceJobStatus::SinkInProgress);
    }

    #[tokio::test]
    async fn test_sink_failure_naks_and_redelivery_sinks_once() {
        let fixture = queued_runner().await;
        let mut sink = MockResultSink::new();
        let mut seq = mockall::Sequence::new();
        sink.expect_ingest()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(VigilError::external("sink", "503 Service Unavailable")));
        sink.expect_ingest()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let handler = RunnerResultHandler::new(fixture.store.clone(), Arc::new(sink), benchmarks(), 3);

        let result = runner_result(&fixture, RunnerStatus::Succeeded, vec![finding("bucket-a", FindingStatus::Alarm)]);
        assert_eq!(handler.handle(&delivery(&result)).await, Disposition::Nak);
        assert_eq!(fixture.store.runners().pop().unwrap().status, RunnerStatus::Succeeded);
        let job = fixture.store.get_compliance_job(fixture.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, ComplianceJobStatus::RunnersInProgress);

        assert_eq!(handler.handle(&delivery(&result)).await, Disposition::Ack);
        let job = fixture.store.get_compliance_job(fixture.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, ComplianceJobStatus::SinkInProgress);
    }

    #[tokio::test]
    async fn test_store_failure_sinks_nothing_until_status_is_recorded() {
        let fixture = queued_runner().await;
        let mut sink = MockResultSink::new();
        sink.expect_ingest().times(1).returning(|_| Ok(()));
        let handler = RunnerResultHandler::new(fixture.store.clone(), Arc::new(sink), benchmarks(), 3);
        let result = runner_result(&fixture, RunnerStatus::Succeeded, vec![finding("bucket-a", FindingStatus::Alarm)]);

        fixture.store.set_unavailable(true);
        assert_eq!(handler.handle(&delivery(&result)).await, Disposition::Nak);

        fixture.store.set_unavailable(false);
        assert_eq!(handler.handle(&delivery(&result)).await, Disposition::Ack);
        assert_eq!(fixture.store.runners().pop().unwrap().status, RunnerStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_redelivered_failure_after_success_is_ignored() {
        let fixture = queued_runner().await;
        let mut sink = MockResultSink::new();
        sink.expect_ingest().times(1).returning(|_| Ok(()));
        let handler = RunnerResultHandler::new(fixture.store.clone(), Arc::new(sink), benchmarks(), 3);

        let done = runner_result(&fixture, RunnerStatus::Succeeded, vec![finding("bucket-a", FindingStatus::Alarm)]);
        assert_eq!(handler.handle(&delivery(&done)).await, Disposition::Ack);
        let late = runner_result(&fixture, RunnerStatus::Failed, vec![]);
        assert_eq!(handler.handle(&delivery(&late)).await, Disposition::Ack);
        assert_eq!(fixture.store.runners().pop().unwrap().status, RunnerStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_scheduler_owned_runner_status_is_dropped() {
        let fixture = queued_runner().await;
        fixture.store.fail_runner(fixture.runner_id, "unknown query", false).await.unwrap();
        let handler = RunnerResultHandler::new(
            fixture.store.clone(),
            Arc::new(MockResultSink::new()),
            benchmarks(),
            3,
        );

        for status in [RunnerStatus::Created, RunnerStatus::Queued] {
            let result = runner_result(&fixture, status, vec![]);
            assert_eq!(handler.handle(&delivery(&result)).await, Disposition::Drop);
        }
        let runner = fixture.store.runners().pop().unwrap();
        assert_eq!(runner.status, RunnerStatus::Failed);
        assert_eq!(runner.retry_count, 0);
    }

    #[tokio::test]
    async fn test_runner_heartbeat_then_failure() {
        let fixture = queued_runner().await;
        let handler = RunnerResultHandler::new(
            fixture.store.clone(),
            Arc::new(MockResultSink::new()),
            benchmarks(),
            3,
        );

        let progress = runner_result(&fixture, RunnerStatus::InProgress, vec![]);
        assert_eq!(handler.handle(&delivery(&progress)).await, Disposition::Ack);
        assert_eq!(fixture.store.runners().pop().unwrap().status, RunnerStatus::InProgress);

        let mut failed = runner_result(&fixture, RunnerStatus::Failed, vec![]);
        failed.error = "steampipe crashed".into();
        assert_eq!(handler.handle(&delivery(&failed)).await, Disposition::Ack);

        let runner = fixture.store.runners().pop().unwrap();
        assert_eq!(runner.status, RunnerStatus::Failed);
        assert_eq!(runner.failure_message.as_deref(), Some("steampipe crashed"));
        // Retries left, so the job keeps waiting.
        let job = fixture.store.get_compliance_job(fixture.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, ComplianceJobStatus::RunnersInProgress);
    }
}
