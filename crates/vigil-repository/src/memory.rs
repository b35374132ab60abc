//! In-memory job store.
//!
//! Mirrors the Postgres stores' conditional-update semantics, including the
//! one-in-flight-job-per-pair constraint and runner identity uniqueness.
//! Used by scheduler tests and for local runs without a database.

use crate::{ComplianceStore, DescribeJobStore, RetrySweep};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use vigil_core::{
    ComplianceJob, ComplianceJobId, ComplianceJobStatus, ComplianceRunner, DescribeJob,
    DescribeJobId, DescribeJobStatus, JobState, Lane, NewComplianceJob, NewComplianceRunner,
    NewDescribeJob, RunnerId, RunnerRecord, RunnerStatus, SequenceNumber, VigilError, VigilResult,
};

#[derive(Default)]
struct State {
    next_id: i64,
    describe_jobs: BTreeMap<DescribeJobId, DescribeJob>,
    compliance_jobs: BTreeMap<ComplianceJobId, ComplianceJob>,
    runners: BTreeMap<RunnerId, ComplianceRunner>,
    malformed: BTreeMap<RunnerId, (u32, String)>,
    identity_keys: HashSet<String>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory implementation of [`DescribeJobStore`] and [`ComplianceStore`].
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    unavailable_lane: Mutex<Option<Lane>>,
}

impl InMemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with a database error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes created describe job fetches for one lane fail until reset.
    pub fn fail_lane(&self, lane: Option<Lane>) {
        *self.unavailable_lane.lock() = lane;
    }

    fn check_available(&self) -> VigilResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(VigilError::Database("job store unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    /// Snapshot of every describe job, in ID order.
    #[must_use]
    pub fn describe_jobs(&self) -> Vec<DescribeJob> {
        self.state.lock().describe_jobs.values().cloned().collect()
    }

    /// Snapshot of every valid runner, in ID order.
    #[must_use]
    pub fn runners(&self) -> Vec<ComplianceRunner> {
        self.state.lock().runners.values().cloned().collect()
    }

    /// Inserts a describe job as-is, bypassing the in-flight check.
    pub fn insert_describe_job(&self, mut job: DescribeJob) -> DescribeJob {
        let mut state = self.state.lock();
        if job.id.into_inner() == 0 {
            job.id = DescribeJobId::new(state.next_id());
        } else {
            state.next_id = state.next_id.max(job.id.into_inner());
        }
        state.describe_jobs.insert(job.id, job.clone());
        job
    }

    /// Rewrites a describe job's `updated_at`, for timeout and retention tests.
    pub fn set_describe_job_updated_at(&self, id: DescribeJobId, at: DateTime<Utc>) {
        if let Some(job) = self.state.lock().describe_jobs.get_mut(&id) {
            job.updated_at = at;
        }
    }

    /// Rewrites a runner's `queued_at` and `updated_at`.
    pub fn set_runner_timestamps(&self, id: RunnerId, at: DateTime<Utc>) {
        if let Some(runner) = self.state.lock().runners.get_mut(&id) {
            runner.updated_at = at;
            if runner.queued_at.is_some() {
                runner.queued_at = Some(at);
            }
        }
    }

    /// Inserts a runner row whose callers cannot be decoded.
    pub fn insert_malformed_runner(&self, reason: &str) -> RunnerId {
        let mut state = self.state.lock();
        let id = RunnerId::new(state.next_id());
        state.malformed.insert(id, (0, reason.to_string()));
        id
    }
}

fn in_lane(trigger: vigil_core::TriggerType, lane: Lane) -> bool {
    Lane::of(trigger) == lane
}

fn fairness<T>(items: &mut [T], key: impl Fn(&T) -> (u32, i64)) {
    items.sort_by_key(|i| key(i));
}

#[async_trait]
impl DescribeJobStore for InMemoryJobStore {
    async fn create_describe_job(&self, new: &NewDescribeJob) -> VigilResult<DescribeJob> {
        self.check_available()?;
        let mut state = self.state.lock();
        let conflict = state.describe_jobs.values().any(|j| {
            j.integration_id == new.integration_id
                && j.resource_type == new.resource_type
                && j.status.is_in_flight()
        });
        if conflict && new.status.is_in_flight() {
            return Err(VigilError::conflict(format!(
                "describe job in flight for {}/{}",
                new.integration_id, new.resource_type
            )));
        }

        let now = Utc::now();
        let job = DescribeJob {
            id: DescribeJobId::new(state.next_id()),
            integration_id: new.integration_id.clone(),
            provider_id: new.provider_id.clone(),
            integration_type: new.integration_type.clone(),
            resource_type: new.resource_type.clone(),
            status: new.status,
            trigger_type: new.trigger_type,
            retry_count: 0,
            retryable: true,
            parent_id: new.parent_id,
            created_by: new.created_by.clone(),
            queue_seq: None,
            queued_at: None,
            failure_message: None,
            error_code: None,
            created_at: now,
            updated_at: now,
        };
        state.describe_jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_describe_job(&self, id: DescribeJobId) -> VigilResult<Option<DescribeJob>> {
        self.check_available()?;
        Ok(self.state.lock().describe_jobs.get(&id).cloned())
    }

    async fn get_last_describe_job(
        &self,
        integration_id: &str,
        resource_type: &str,
    ) -> VigilResult<Option<DescribeJob>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .describe_jobs
            .values()
            .rev()
            .find(|j| j.integration_id == integration_id && j.resource_type == resource_type)
            .cloned())
    }

    async fn list_created_jobs(&self, limit: u32, lane: Lane) -> VigilResult<Vec<DescribeJob>> {
        self.check_available()?;
        if *self.unavailable_lane.lock() == Some(lane) {
            return Err(VigilError::Database(format!("{lane} lane unavailable")));
        }
        let mut jobs: Vec<DescribeJob> = self
            .state
            .lock()
            .describe_jobs
            .values()
            .filter(|j| j.status == DescribeJobStatus::Created && in_lane(j.trigger_type, lane))
            .cloned()
            .collect();
        fairness(&mut jobs, |j| (j.retry_count, j.id.into_inner()));
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn count_running_per_resource_type(&self) -> VigilResult<HashMap<String, u64>> {
        self.check_available()?;
        let mut counts = HashMap::new();
        for job in self.state.lock().describe_jobs.values() {
            if job.status.is_running() {
                *counts.entry(job.resource_type.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn count_queued_jobs(&self) -> VigilResult<u64> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .describe_jobs
            .values()
            .filter(|j| j.status == DescribeJobStatus::Queued)
            .count() as u64)
    }

    async fn count_queued_since(&self, since: DateTime<Utc>) -> VigilResult<u64> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .describe_jobs
            .values()
            .filter(|j| j.queued_at.is_some_and(|at| at >= since))
            .count() as u64)
    }

    async fn mark_queued(&self, id: DescribeJobId, seq: SequenceNumber) -> VigilResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        let Some(job) = state.describe_jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !job.status.can_transition_to(DescribeJobStatus::Queued) {
            return Ok(false);
        }
        let now = Utc::now();
        job.status = DescribeJobStatus::Queued;
        job.queue_seq = Some(seq);
        job.queued_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn mark_in_progress(&self, id: DescribeJobId, retry_count: u32) -> VigilResult<bool> {
        self.complete_describe_job(id, retry_count, DescribeJobStatus::InProgress, None, None)
            .await
    }

    async fn complete_describe_job(
        &self,
        id: DescribeJobId,
        retry_count: u32,
        status: DescribeJobStatus,
        failure_message: Option<&str>,
        error_code: Option<&str>,
    ) -> VigilResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        let Some(job) = state.describe_jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.retry_count != retry_count || !job.status.can_transition_to(status) {
            return Ok(false);
        }
        job.status = status;
        if status != DescribeJobStatus::InProgress {
            job.failure_message = failure_message.map(str::to_string);
            job.error_code = error_code.map(str::to_string);
        }
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail_describe_job(
        &self,
        id: DescribeJobId,
        message: &str,
        retryable: bool,
    ) -> VigilResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        let Some(job) = state.describe_jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !job.status.can_transition_to(DescribeJobStatus::Failed) {
            return Ok(false);
        }
        job.status = DescribeJobStatus::Failed;
        job.failure_message = Some(message.to_string());
        job.retryable = retryable;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn retry_failed_jobs(&self, max_retries: u32) -> VigilResult<RetrySweep> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Utc::now();
        let mut sweep = RetrySweep::default();

        for job in state.describe_jobs.values_mut() {
            if job.status == DescribeJobStatus::TimedOut
                && (job.retry_count >= max_retries || !job.retryable)
            {
                job.status = DescribeJobStatus::Failed;
                job.updated_at = now;
                sweep.exhausted += 1;
            }
        }

        let mut latest: HashMap<(String, String), DescribeJobId> = HashMap::new();
        for job in state.describe_jobs.values() {
            latest.insert((job.integration_id.clone(), job.resource_type.clone()), job.id);
        }

        for job in state.describe_jobs.values_mut() {
            let is_latest = latest
                .get(&(job.integration_id.clone(), job.resource_type.clone()))
                .is_some_and(|id| *id == job.id);
            if is_latest
                && job.status.is_retry_eligible()
                && job.retryable
                && job.retry_count < max_retries
            {
                job.status = DescribeJobStatus::Created;
                job.retry_count += 1;
                job.queue_seq = None;
                job.queued_at = None;
                job.failure_message = None;
                job.error_code = None;
                job.updated_at = now;
                sweep.retried += 1;
            }
        }

        Ok(sweep)
    }

    async fn time_out_stale_jobs(&self, before: DateTime<Utc>) -> VigilResult<u64> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Utc::now();
        let mut count = 0;
        for job in state.describe_jobs.values_mut() {
            if job.status.can_transition_to(DescribeJobStatus::TimedOut) && job.updated_at < before {
                job.status = DescribeJobStatus::TimedOut;
                job.failure_message = Some("job timed out".to_string());
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_removing_resources_jobs(&self, limit: u32) -> VigilResult<Vec<DescribeJob>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .describe_jobs
            .values()
            .filter(|j| j.status == DescribeJobStatus::RemovingResources)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn cancel_jobs_for_integration(&self, integration_id: &str) -> VigilResult<u64> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Utc::now();
        let mut count = 0;
        for job in state.describe_jobs.values_mut() {
            if job.integration_id == integration_id && job.status.is_in_flight() {
                job.status = DescribeJobStatus::Canceled;
                job.failure_message = Some("integration disabled".to_string());
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_jobs_older_than(&self, before: DateTime<Utc>) -> VigilResult<u64> {
        self.check_available()?;
        let mut state = self.state.lock();
        let len = state.describe_jobs.len();
        state
            .describe_jobs
            .retain(|_, j| !(j.status.is_terminal() && j.updated_at < before));
        Ok((len - state.describe_jobs.len()) as u64)
    }
}

#[async_trait]
impl ComplianceStore for InMemoryJobStore {
    async fn create_compliance_job(&self, new: &NewComplianceJob) -> VigilResult<ComplianceJob> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Utc::now();
        let job = ComplianceJob {
            id: ComplianceJobId::new(state.next_id()),
            framework_id: new.framework_id.clone(),
            status: ComplianceJobStatus::Created,
            integration_ids: new.integration_ids.clone(),
            with_incidents: new.with_incidents,
            include_results: new.include_results.clone(),
            are_all_runners_queued: false,
            trigger_type: new.trigger_type,
            parent_id: new.parent_id,
            created_by: new.created_by.clone(),
            failure_message: None,
            created_at: now,
            updated_at: now,
        };
        state.compliance_jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_compliance_job(&self, id: ComplianceJobId) -> VigilResult<Option<ComplianceJob>> {
        self.check_available()?;
        Ok(self.state.lock().compliance_jobs.get(&id).cloned())
    }

    async fn list_compliance_jobs_by_status(
        &self,
        status: ComplianceJobStatus,
    ) -> VigilResult<Vec<ComplianceJob>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .compliance_jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect())
    }

    async fn update_compliance_job_status(
        &self,
        id: ComplianceJobId,
        status: ComplianceJobStatus,
        failure_message: Option<&str>,
    ) -> VigilResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        let Some(job) = state.compliance_jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !job.status.can_transition_to(status) {
            return Ok(false);
        }
        job.status = status;
        if let Some(message) = failure_message {
            job.failure_message = Some(message.to_string());
        }
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_all_runners_queued(&self, id: ComplianceJobId) -> VigilResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        match state.compliance_jobs.get_mut(&id) {
            Some(job) if !job.are_all_runners_queued => {
                job.are_all_runners_queued = true;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_runners(&self, runners: &[NewComplianceRunner]) -> VigilResult<Vec<RunnerId>> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Utc::now();
        let mut ids = Vec::with_capacity(runners.len());

        for new in runners {
            let runner = ComplianceRunner {
                id: RunnerId::new(0),
                parent_job_id: new.parent_job_id,
                framework_id: new.framework_id.clone(),
                query_id: new.query_id.clone(),
                integration_id: new.integration_id.clone(),
                resource_collection_id: new.resource_collection_id.clone(),
                callers: new.callers.clone(),
                status: RunnerStatus::Created,
                trigger_type: new.trigger_type,
                retry_count: 0,
                retryable: true,
                queue_seq: None,
                queued_at: None,
                started_at: None,
                total_finding_count: None,
                failure_message: None,
                created_at: now,
                updated_at: now,
            };
            if !state.identity_keys.insert(runner.identity_key()) {
                continue;
            }
            let id = RunnerId::new(state.next_id());
            state.runners.insert(id, ComplianceRunner { id, ..runner });
            ids.push(id);
        }

        Ok(ids)
    }

    async fn get_runner(&self, id: RunnerId) -> VigilResult<Option<RunnerRecord>> {
        self.check_available()?;
        let state = self.state.lock();
        if let Some((retry_count, reason)) = state.malformed.get(&id) {
            return Ok(Some(RunnerRecord::Malformed {
                id,
                retry_count: *retry_count,
                reason: reason.clone(),
            }));
        }
        Ok(state.runners.get(&id).cloned().map(RunnerRecord::Valid))
    }

    async fn fetch_created_runners(&self, limit: u32, lane: Lane) -> VigilResult<Vec<RunnerRecord>> {
        self.check_available()?;
        let state = self.state.lock();
        let mut records: Vec<RunnerRecord> = state
            .malformed
            .iter()
            .map(|(id, (retry_count, reason))| RunnerRecord::Malformed {
                id: *id,
                retry_count: *retry_count,
                reason: reason.clone(),
            })
            .collect();
        let mut valid: Vec<&ComplianceRunner> = state
            .runners
            .values()
            .filter(|r| r.status == RunnerStatus::Created && in_lane(r.trigger_type, lane))
            .collect();
        fairness(&mut valid, |r| (r.retry_count, r.id.into_inner()));
        records.extend(valid.into_iter().cloned().map(RunnerRecord::Valid));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn count_created_runners(&self, job_id: ComplianceJobId) -> VigilResult<u64> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .runners
            .values()
            .filter(|r| r.parent_job_id == job_id && r.status == RunnerStatus::Created)
            .count() as u64)
    }

    async fn mark_runner_queued(&self, id: RunnerId, seq: SequenceNumber) -> VigilResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        let Some(runner) = state.runners.get_mut(&id) else {
            return Ok(false);
        };
        if !runner.status.can_transition_to(RunnerStatus::Queued) {
            return Ok(false);
        }
        let now = Utc::now();
        runner.status = RunnerStatus::Queued;
        runner.queue_seq = Some(seq);
        runner.queued_at = Some(now);
        runner.updated_at = now;
        Ok(true)
    }

    async fn mark_runner_in_progress(&self, id: RunnerId, retry_count: u32) -> VigilResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        let Some(runner) = state.runners.get_mut(&id) else {
            return Ok(false);
        };
        if runner.retry_count != retry_count
            || !runner.status.can_transition_to(RunnerStatus::InProgress)
        {
            return Ok(false);
        }
        let now = Utc::now();
        runner.status = RunnerStatus::InProgress;
        runner.started_at.get_or_insert(now);
        runner.updated_at = now;
        Ok(true)
    }

    async fn complete_runner(
        &self,
        id: RunnerId,
        retry_count: u32,
        status: RunnerStatus,
        failure_message: Option<&str>,
        total_finding_count: Option<i64>,
    ) -> VigilResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        let Some(runner) = state.runners.get_mut(&id) else {
            return Ok(false);
        };
        if runner.retry_count != retry_count || !runner.status.can_transition_to(status) {
            return Ok(false);
        }
        runner.status = status;
        runner.failure_message = failure_message.map(str::to_string);
        runner.total_finding_count = total_finding_count;
        runner.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail_runner(&self, id: RunnerId, message: &str, retryable: bool) -> VigilResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        // A malformed row is failed by dropping it from the Created backlog.
        if state.malformed.remove(&id).is_some() {
            return Ok(true);
        }
        let Some(runner) = state.runners.get_mut(&id) else {
            return Ok(false);
        };
        if !runner.status.can_transition_to(RunnerStatus::Failed) {
            return Ok(false);
        }
        runner.status = RunnerStatus::Failed;
        runner.failure_message = Some(message.to_string());
        runner.retryable = retryable;
        runner.updated_at = Utc::now();
        Ok(true)
    }

    async fn time_out_queued_runners(&self, before: DateTime<Utc>) -> VigilResult<u64> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Utc::now();
        let mut count = 0;
        for runner in state.runners.values_mut() {
            if runner.status == RunnerStatus::Queued && runner.queued_at.is_some_and(|at| at < before) {
                runner.status = RunnerStatus::TimedOut;
                runner.failure_message = Some("runner timed out in queue".to_string());
                runner.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn time_out_in_progress_runners(&self, before: DateTime<Utc>) -> VigilResult<u64> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Utc::now();
        let mut count = 0;
        for runner in state.runners.values_mut() {
            if runner.status == RunnerStatus::InProgress && runner.updated_at < before {
                runner.status = RunnerStatus::TimedOut;
                runner.failure_message = Some("runner stopped reporting progress".to_string());
                runner.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn retry_failed_runners(&self, max_retries: u32) -> VigilResult<RetrySweep> {
        self.check_available()?;
        let mut state = self.state.lock();
        let now = Utc::now();
        let mut sweep = RetrySweep::default();
        let active: HashSet<ComplianceJobId> = state
            .compliance_jobs
            .values()
            .filter(|j| j.status == ComplianceJobStatus::RunnersInProgress)
            .map(|j| j.id)
            .collect();

        for runner in state.runners.values_mut() {
            if runner.status == RunnerStatus::TimedOut
                && (runner.retry_count >= max_retries || !runner.retryable)
            {
                runner.status = RunnerStatus::Failed;
                runner.updated_at = now;
                sweep.exhausted += 1;
            } else if active.contains(&runner.parent_job_id)
                && runner.status.can_transition_to(RunnerStatus::Created)
                && runner.retryable
                && runner.retry_count < max_retries
            {
                runner.status = RunnerStatus::Created;
                runner.retry_count += 1;
                runner.queue_seq = None;
                runner.queued_at = None;
                runner.started_at = None;
                runner.failure_message = None;
                runner.total_finding_count = None;
                runner.updated_at = now;
                sweep.retried += 1;
            }
        }

        Ok(sweep)
    }

    async fn count_unfinished_runners(
        &self,
        job_id: ComplianceJobId,
        max_retries: u32,
    ) -> VigilResult<u64> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .runners
            .values()
            .filter(|r| r.parent_job_id == job_id)
            .filter(|r| {
                !r.status.is_terminal()
                    || (r.status.can_transition_to(RunnerStatus::Created)
                        && r.retryable
                        && r.retry_count < max_retries)
            })
            .count() as u64)
    }

    async fn delete_compliance_jobs_older_than(&self, before: DateTime<Utc>) -> VigilResult<u64> {
        self.check_available()?;
        let mut state = self.state.lock();
        let doomed: HashSet<ComplianceJobId> = state
            .compliance_jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.updated_at < before)
            .map(|j| j.id)
            .collect();
        state.compliance_jobs.retain(|id, _| !doomed.contains(id));
        state.runners.retain(|_, r| !doomed.contains(&r.parent_job_id));
        Ok(doomed.len() as u64)
    }
}
