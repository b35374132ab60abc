//! Postgres compliance job and runner store.

use super::{
    lane_triggers, non_terminal_strs, retry_from_db, retry_to_db, seq_from_db, seq_to_db,
    terminal_strs,
};
use crate::{ComplianceStore, DatabasePoolInterface, RetrySweep};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shaku::Component;
use sqlx::FromRow;
use std::sync::Arc;
use tracing::{debug, warn};
use vigil_core::{
    decode_callers, runner_identity_key, ComplianceJob, ComplianceJobId, ComplianceJobStatus,
    ComplianceRunner, JobState, Lane, NewComplianceJob, NewComplianceRunner, RunnerId,
    RunnerRecord, RunnerStatus, SequenceNumber, VigilError, VigilResult,
};

const JOB_COLUMNS: &str = "id, framework_id, status, integration_ids, with_incidents, \
    include_results, are_all_runners_queued, trigger_type, parent_id, created_by, \
    failure_message, created_at, updated_at";

const RUNNER_COLUMNS: &str = "id, parent_job_id, framework_id, query_id, integration_id, \
    resource_collection_id, callers, status, trigger_type, retry_count, retryable, queue_seq, \
    queued_at, started_at, total_finding_count, failure_message, created_at, updated_at";

/// Postgres compliance store.
#[derive(Component, Clone)]
#[shaku(interface = ComplianceStore)]
pub struct PgComplianceStore {
    #[shaku(inject)]
    pool: Arc<dyn DatabasePoolInterface>,
}

impl PgComplianceStore {
    /// Creates a new store over a pool.
    #[must_use]
    pub fn new(pool: Arc<dyn DatabasePoolInterface>) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct ComplianceJobRow {
    id: i64,
    framework_id: String,
    status: String,
    integration_ids: Vec<String>,
    with_incidents: bool,
    include_results: Vec<String>,
    are_all_runners_queued: bool,
    trigger_type: String,
    parent_id: Option<i64>,
    created_by: String,
    failure_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ComplianceJobRow> for ComplianceJob {
    type Error = VigilError;

    fn try_from(row: ComplianceJobRow) -> Result<Self, Self::Error> {
        Ok(ComplianceJob {
            id: ComplianceJobId::new(row.id),
            framework_id: row.framework_id,
            status: row.status.parse()?,
            integration_ids: row.integration_ids,
            with_incidents: row.with_incidents,
            include_results: row.include_results,
            are_all_runners_queued: row.are_all_runners_queued,
            trigger_type: row.trigger_type.parse()?,
            parent_id: row.parent_id,
            created_by: row.created_by,
            failure_message: row.failure_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RunnerRow {
    id: i64,
    parent_job_id: i64,
    framework_id: String,
    query_id: String,
    integration_id: Option<String>,
    resource_collection_id: Option<String>,
    callers: serde_json::Value,
    status: String,
    trigger_type: String,
    retry_count: i32,
    retryable: bool,
    queue_seq: Option<i64>,
    queued_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    total_finding_count: Option<i64>,
    failure_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RunnerRow> for ComplianceRunner {
    type Error = VigilError;

    fn try_from(row: RunnerRow) -> Result<Self, Self::Error> {
        Ok(ComplianceRunner {
            id: RunnerId::new(row.id),
            parent_job_id: ComplianceJobId::new(row.parent_job_id),
            framework_id: row.framework_id,
            query_id: row.query_id,
            integration_id: row.integration_id,
            resource_collection_id: row.resource_collection_id,
            callers: decode_callers(&row.callers)?,
            status: row.status.parse()?,
            trigger_type: row.trigger_type.parse()?,
            retry_count: retry_from_db(row.retry_count)?,
            retryable: row.retryable,
            queue_seq: seq_from_db(row.queue_seq)?,
            queued_at: row.queued_at,
            started_at: row.started_at,
            total_finding_count: row.total_finding_count,
            failure_message: row.failure_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Decodes a runner row, keeping rows that fail to decode visible as `Malformed`.
fn into_record(row: RunnerRow) -> RunnerRecord {
    let id = RunnerId::new(row.id);
    let retry_count = u32::try_from(row.retry_count).unwrap_or(0);
    match ComplianceRunner::try_from(row) {
        Ok(runner) => RunnerRecord::Valid(runner),
        Err(e) => {
            warn!(runner_id = %id, error = %e, "Malformed compliance runner row");
            RunnerRecord::Malformed {
                id,
                retry_count,
                reason: e.to_string(),
            }
        }
    }
}

fn retry_eligible() -> Vec<String> {
    RunnerStatus::predecessor_strs(RunnerStatus::Created)
}

#[async_trait]
impl ComplianceStore for PgComplianceStore {
    async fn create_compliance_job(&self, job: &NewComplianceJob) -> VigilResult<ComplianceJob> {
        debug!(framework_id = %job.framework_id, "Creating compliance job");

        let sql = format!(
            r#"
            INSERT INTO compliance_jobs
                (framework_id, status, integration_ids, with_incidents, include_results,
                 trigger_type, parent_id, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, ComplianceJobRow>(&sql)
            .bind(&job.framework_id)
            .bind(ComplianceJobStatus::Created.as_str())
            .bind(&job.integration_ids)
            .bind(job.with_incidents)
            .bind(&job.include_results)
            .bind(job.trigger_type.as_str())
            .bind(job.parent_id)
            .bind(&job.created_by)
            .fetch_one(self.pool.inner())
            .await?;

        ComplianceJob::try_from(row)
    }

    async fn get_compliance_job(&self, id: ComplianceJobId) -> VigilResult<Option<ComplianceJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM compliance_jobs WHERE id = $1");
        let row = sqlx::query_as::<_, ComplianceJobRow>(&sql)
            .bind(id.into_inner())
            .fetch_optional(self.pool.inner())
            .await?;

        row.map(ComplianceJob::try_from).transpose()
    }

    async fn list_compliance_jobs_by_status(
        &self,
        status: ComplianceJobStatus,
    ) -> VigilResult<Vec<ComplianceJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM compliance_jobs WHERE status = $1 ORDER BY id");
        let rows = sqlx::query_as::<_, ComplianceJobRow>(&sql)
            .bind(status.as_str())
            .fetch_all(self.pool.inner())
            .await?;

        rows.into_iter().map(ComplianceJob::try_from).collect()
    }

    async fn update_compliance_job_status(
        &self,
        id: ComplianceJobId,
        status: ComplianceJobStatus,
        failure_message: Option<&str>,
    ) -> VigilResult<bool> {
        debug!(compliance_job_id = %id, %status, "Updating compliance job status");

        let result = sqlx::query(
            r#"
            UPDATE compliance_jobs
            SET status = $2, failure_message = COALESCE($3, failure_message), updated_at = NOW()
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id.into_inner())
        .bind(status.as_str())
        .bind(failure_message)
        .bind(ComplianceJobStatus::predecessor_strs(status))
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_all_runners_queued(&self, id: ComplianceJobId) -> VigilResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE compliance_jobs
            SET are_all_runners_queued = TRUE, updated_at = NOW()
            WHERE id = $1 AND NOT are_all_runners_queued
            "#,
        )
        .bind(id.into_inner())
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_runners(&self, runners: &[NewComplianceRunner]) -> VigilResult<Vec<RunnerId>> {
        let mut tx = self.pool.inner().begin().await?;
        let mut ids = Vec::with_capacity(runners.len());

        for runner in runners {
            let key = runner_identity_key(
                &runner.framework_id,
                &runner.query_id,
                runner.integration_id.as_deref(),
                runner.parent_job_id,
            );
            let id: Option<(i64,)> = sqlx::query_as(
                r#"
                INSERT INTO compliance_runners
                    (parent_job_id, framework_id, query_id, integration_id,
                     resource_collection_id, callers, status, trigger_type, identity_key)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (identity_key) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(runner.parent_job_id.into_inner())
            .bind(&runner.framework_id)
            .bind(&runner.query_id)
            .bind(&runner.integration_id)
            .bind(&runner.resource_collection_id)
            .bind(serde_json::to_value(&runner.callers)?)
            .bind(RunnerStatus::Created.as_str())
            .bind(runner.trigger_type.as_str())
            .bind(&key)
            .fetch_optional(&mut *tx)
            .await?;

            match id {
                Some((id,)) => ids.push(RunnerId::new(id)),
                None => debug!(identity_key = %key, "Runner already exists, skipping"),
            }
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn get_runner(&self, id: RunnerId) -> VigilResult<Option<RunnerRecord>> {
        let sql = format!("SELECT {RUNNER_COLUMNS} FROM compliance_runners WHERE id = $1");
        let row = sqlx::query_as::<_, RunnerRow>(&sql)
            .bind(id.into_inner())
            .fetch_optional(self.pool.inner())
            .await?;

        Ok(row.map(into_record))
    }

    async fn fetch_created_runners(&self, limit: u32, lane: Lane) -> VigilResult<Vec<RunnerRecord>> {
        let sql = format!(
            r#"
            SELECT {RUNNER_COLUMNS} FROM compliance_runners
            WHERE status = $1 AND trigger_type = ANY($2)
            ORDER BY retry_count ASC, id ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query_as::<_, RunnerRow>(&sql)
            .bind(RunnerStatus::Created.as_str())
            .bind(lane_triggers(lane))
            .bind(i64::from(limit))
            .fetch_all(self.pool.inner())
            .await?;

        Ok(rows.into_iter().map(into_record).collect())
    }

    async fn count_created_runners(&self, job_id: ComplianceJobId) -> VigilResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM compliance_runners WHERE parent_job_id = $1 AND status = $2",
        )
        .bind(job_id.into_inner())
        .bind(RunnerStatus::Created.as_str())
        .fetch_one(self.pool.inner())
        .await?;

        Ok(count.max(0).unsigned_abs())
    }

    async fn mark_runner_queued(&self, id: RunnerId, seq: SequenceNumber) -> VigilResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE compliance_runners
            SET status = $2, queue_seq = $3, queued_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id.into_inner())
        .bind(RunnerStatus::Queued.as_str())
        .bind(seq_to_db(seq)?)
        .bind(RunnerStatus::predecessor_strs(RunnerStatus::Queued))
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_runner_in_progress(&self, id: RunnerId, retry_count: u32) -> VigilResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE compliance_runners
            SET status = $2, started_at = COALESCE(started_at, NOW()), updated_at = NOW()
            WHERE id = $1 AND retry_count = $3 AND status = ANY($4)
            "#,
        )
        .bind(id.into_inner())
        .bind(RunnerStatus::InProgress.as_str())
        .bind(retry_to_db(retry_count))
        .bind(RunnerStatus::predecessor_strs(RunnerStatus::InProgress))
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_runner(
        &self,
        id: RunnerId,
        retry_count: u32,
        status: RunnerStatus,
        failure_message: Option<&str>,
        total_finding_count: Option<i64>,
    ) -> VigilResult<bool> {
        debug!(runner_id = %id, retry_count, %status, "Completing compliance runner");

        let result = sqlx::query(
            r#"
            UPDATE compliance_runners
            SET status = $2, failure_message = $3, total_finding_count = $4, updated_at = NOW()
            WHERE id = $1 AND retry_count = $5 AND status = ANY($6)
            "#,
        )
        .bind(id.into_inner())
        .bind(status.as_str())
        .bind(failure_message)
        .bind(total_finding_count)
        .bind(retry_to_db(retry_count))
        .bind(RunnerStatus::predecessor_strs(status))
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_runner(&self, id: RunnerId, message: &str, retryable: bool) -> VigilResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE compliance_runners
            SET status = $2, failure_message = $3, retryable = $4, updated_at = NOW()
            WHERE id = $1 AND status = ANY($5)
            "#,
        )
        .bind(id.into_inner())
        .bind(RunnerStatus::Failed.as_str())
        .bind(message)
        .bind(retryable)
        .bind(RunnerStatus::predecessor_strs(RunnerStatus::Failed))
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn time_out_queued_runners(&self, before: DateTime<Utc>) -> VigilResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE compliance_runners
            SET status = $1, failure_message = 'runner timed out in queue', updated_at = NOW()
            WHERE status = $2 AND queued_at < $3
            "#,
        )
        .bind(RunnerStatus::TimedOut.as_str())
        .bind(RunnerStatus::Queued.as_str())
        .bind(before)
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected())
    }

    async fn time_out_in_progress_runners(&self, before: DateTime<Utc>) -> VigilResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE compliance_runners
            SET status = $1, failure_message = 'runner stopped reporting progress', updated_at = NOW()
            WHERE status = $2 AND updated_at < $3
            "#,
        )
        .bind(RunnerStatus::TimedOut.as_str())
        .bind(RunnerStatus::InProgress.as_str())
        .bind(before)
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected())
    }

    async fn retry_failed_runners(&self, max_retries: u32) -> VigilResult<RetrySweep> {
        let mut tx = self.pool.inner().begin().await?;

        let exhausted = sqlx::query(
            r#"
            UPDATE compliance_runners
            SET status = $1, updated_at = NOW()
            WHERE status = $2 AND (retry_count >= $3 OR NOT retryable)
            "#,
        )
        .bind(RunnerStatus::Failed.as_str())
        .bind(RunnerStatus::TimedOut.as_str())
        .bind(retry_to_db(max_retries))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let retried = sqlx::query(
            r#"
            UPDATE compliance_runners r
            SET status = $1, retry_count = r.retry_count + 1, queue_seq = NULL, queued_at = NULL,
                started_at = NULL, failure_message = NULL, total_finding_count = NULL,
                updated_at = NOW()
            FROM compliance_jobs j
            WHERE j.id = r.parent_job_id
              AND j.status = $2
              AND r.status = ANY($3)
              AND r.retryable
              AND r.retry_count < $4
            "#,
        )
        .bind(RunnerStatus::Created.as_str())
        .bind(ComplianceJobStatus::RunnersInProgress.as_str())
        .bind(retry_eligible())
        .bind(retry_to_db(max_retries))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        Ok(RetrySweep { retried, exhausted })
    }

    async fn count_unfinished_runners(
        &self,
        job_id: ComplianceJobId,
        max_retries: u32,
    ) -> VigilResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM compliance_runners
            WHERE parent_job_id = $1
              AND (status = ANY($2)
                   OR (status = ANY($3) AND retryable AND retry_count < $4))
            "#,
        )
        .bind(job_id.into_inner())
        .bind(non_terminal_strs::<RunnerStatus>())
        .bind(retry_eligible())
        .bind(retry_to_db(max_retries))
        .fetch_one(self.pool.inner())
        .await?;

        Ok(count.max(0).unsigned_abs())
    }

    async fn delete_compliance_jobs_older_than(&self, before: DateTime<Utc>) -> VigilResult<u64> {
        let result =
            sqlx::query("DELETE FROM compliance_jobs WHERE status = ANY($1) AND updated_at < $2")
                .bind(terminal_strs::<ComplianceJobStatus>())
                .bind(before)
                .execute(self.pool.inner())
                .await?;

        Ok(result.rows_affected())
    }
}
