//! Job store trait definitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use vigil_core::{
    ComplianceJob, ComplianceJobId, ComplianceJobStatus, DescribeJob, DescribeJobId,
    DescribeJobStatus, Interface, Lane, NewComplianceJob, NewComplianceRunner, NewDescribeJob,
    RunnerId, RunnerRecord, RunnerStatus, SequenceNumber, VigilResult,
};

/// Outcome of a retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySweep {
    /// Records reset to `Created` with the retry counter bumped.
    pub retried: u64,
    /// Timed out records whose retries are exhausted, now permanently `Failed`.
    pub exhausted: u64,
}

/// Store operations on describe jobs.
///
/// Conditional updates return `false` when the row was not in a state the
/// transition allows (or the retry counter no longer matches), which callers
/// treat as a lost race rather than an error.
#[async_trait]
pub trait DescribeJobStore: Interface + Send + Sync {
    /// Inserts a job. Fails with `Conflict` if the pair already has a job in flight.
    async fn create_describe_job(&self, job: &NewDescribeJob) -> VigilResult<DescribeJob>;

    /// Loads a job by ID.
    async fn get_describe_job(&self, id: DescribeJobId) -> VigilResult<Option<DescribeJob>>;

    /// Most recent job of an (integration, resource type) pair.
    async fn get_last_describe_job(
        &self,
        integration_id: &str,
        resource_type: &str,
    ) -> VigilResult<Option<DescribeJob>>;

    /// Bounded batch of `Created` jobs of one lane, fewest retries first, then oldest.
    async fn list_created_jobs(&self, limit: u32, lane: Lane) -> VigilResult<Vec<DescribeJob>>;

    /// Queued and in-progress jobs grouped by resource type.
    async fn count_running_per_resource_type(&self) -> VigilResult<HashMap<String, u64>>;

    /// Current queue depth: jobs in `Queued`.
    async fn count_queued_jobs(&self) -> VigilResult<u64>;

    /// Jobs published at or after `since`.
    async fn count_queued_since(&self, since: DateTime<Utc>) -> VigilResult<u64>;

    /// `Created -> Queued`, persisting the queue sequence number.
    async fn mark_queued(&self, id: DescribeJobId, seq: SequenceNumber) -> VigilResult<bool>;

    /// `Queued | InProgress -> InProgress` for the given attempt.
    async fn mark_in_progress(&self, id: DescribeJobId, retry_count: u32) -> VigilResult<bool>;

    /// Applies a worker-reported status to the given attempt.
    async fn complete_describe_job(
        &self,
        id: DescribeJobId,
        retry_count: u32,
        status: DescribeJobStatus,
        failure_message: Option<&str>,
        error_code: Option<&str>,
    ) -> VigilResult<bool>;

    /// Marks a job `Failed`. `retryable = false` keeps the retry sweep away from it.
    async fn fail_describe_job(
        &self,
        id: DescribeJobId,
        message: &str,
        retryable: bool,
    ) -> VigilResult<bool>;

    /// Resets retry-eligible jobs to `Created` and settles exhausted ones as `Failed`.
    async fn retry_failed_jobs(&self, max_retries: u32) -> VigilResult<RetrySweep>;

    /// Times out queued and in-progress jobs untouched since `before`.
    async fn time_out_stale_jobs(&self, before: DateTime<Utc>) -> VigilResult<u64>;

    /// Jobs in `RemovingResources`.
    async fn list_removing_resources_jobs(&self, limit: u32) -> VigilResult<Vec<DescribeJob>>;

    /// Cancels every in-flight job of an integration.
    async fn cancel_jobs_for_integration(&self, integration_id: &str) -> VigilResult<u64>;

    /// Hard-deletes terminal jobs last updated before `before`.
    async fn delete_jobs_older_than(&self, before: DateTime<Utc>) -> VigilResult<u64>;
}

/// Store operations on compliance jobs and runners.
#[async_trait]
pub trait ComplianceStore: Interface + Send + Sync {
    /// Inserts a compliance job in `Created`.
    async fn create_compliance_job(&self, job: &NewComplianceJob) -> VigilResult<ComplianceJob>;

    /// Loads a compliance job by ID.
    async fn get_compliance_job(&self, id: ComplianceJobId) -> VigilResult<Option<ComplianceJob>>;

    /// Compliance jobs in the given status.
    async fn list_compliance_jobs_by_status(
        &self,
        status: ComplianceJobStatus,
    ) -> VigilResult<Vec<ComplianceJob>>;

    /// Validated status change of a compliance job.
    async fn update_compliance_job_status(
        &self,
        id: ComplianceJobId,
        status: ComplianceJobStatus,
        failure_message: Option<&str>,
    ) -> VigilResult<bool>;

    /// Records that no runner of the job is left in `Created`.
    async fn set_all_runners_queued(&self, id: ComplianceJobId) -> VigilResult<bool>;

    /// Inserts runners in `Created`. Runners whose identity key already exists are skipped.
    async fn create_runners(&self, runners: &[NewComplianceRunner]) -> VigilResult<Vec<RunnerId>>;

    /// Loads a runner by ID.
    async fn get_runner(&self, id: RunnerId) -> VigilResult<Option<RunnerRecord>>;

    /// Bounded batch of `Created` runners of one lane.
    async fn fetch_created_runners(&self, limit: u32, lane: Lane) -> VigilResult<Vec<RunnerRecord>>;

    /// Runners of the job still in `Created`.
    async fn count_created_runners(&self, job_id: ComplianceJobId) -> VigilResult<u64>;

    /// `Created -> Queued`, persisting the queue sequence number.
    async fn mark_runner_queued(&self, id: RunnerId, seq: SequenceNumber) -> VigilResult<bool>;

    /// `Queued | InProgress -> InProgress` for the given attempt. Doubles as heartbeat.
    async fn mark_runner_in_progress(&self, id: RunnerId, retry_count: u32) -> VigilResult<bool>;

    /// Applies a worker-reported terminal status to the given attempt.
    async fn complete_runner(
        &self,
        id: RunnerId,
        retry_count: u32,
        status: RunnerStatus,
        failure_message: Option<&str>,
        total_finding_count: Option<i64>,
    ) -> VigilResult<bool>;

    /// Marks a runner `Failed`. `retryable = false` keeps the retry sweep away from it.
    async fn fail_runner(&self, id: RunnerId, message: &str, retryable: bool) -> VigilResult<bool>;

    /// Times out runners queued before `before`.
    async fn time_out_queued_runners(&self, before: DateTime<Utc>) -> VigilResult<u64>;

    /// Times out in-progress runners without a heartbeat since `before`.
    async fn time_out_in_progress_runners(&self, before: DateTime<Utc>) -> VigilResult<u64>;

    /// Resets retry-eligible runners of jobs still in `RunnersInProgress` to
    /// `Created` and settles exhausted ones as `Failed`.
    async fn retry_failed_runners(&self, max_retries: u32) -> VigilResult<RetrySweep>;

    /// Runners of the job that are not finished for good: not yet terminal,
    /// or failed with retries left.
    async fn count_unfinished_runners(
        &self,
        job_id: ComplianceJobId,
        max_retries: u32,
    ) -> VigilResult<u64>;

    /// Hard-deletes terminal compliance jobs (and their runners) last updated before `before`.
    async fn delete_compliance_jobs_older_than(&self, before: DateTime<Utc>) -> VigilResult<u64>;
}
