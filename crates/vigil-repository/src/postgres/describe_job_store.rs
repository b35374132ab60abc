//! Postgres describe job store.

use super::{
    lane_triggers, non_terminal_strs, retry_from_db, retry_to_db, seq_from_db, seq_to_db,
    state_strs, terminal_strs,
};
use crate::{DatabasePoolInterface, DescribeJobStore, RetrySweep};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shaku::Component;
use sqlx::FromRow;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use vigil_core::{
    DescribeJob, DescribeJobId, DescribeJobStatus, JobState, Lane, NewDescribeJob,
    SequenceNumber, VigilError, VigilResult,
};

const COLUMNS: &str = "id, integration_id, provider_id, integration_type, resource_type, status, \
    trigger_type, retry_count, retryable, parent_id, created_by, queue_seq, queued_at, \
    failure_message, error_code, created_at, updated_at";

/// Postgres describe job store.
#[derive(Component, Clone)]
#[shaku(interface = DescribeJobStore)]
pub struct PgDescribeJobStore {
    #[shaku(inject)]
    pool: Arc<dyn DatabasePoolInterface>,
}

impl PgDescribeJobStore {
    /// Creates a new store over a pool.
    #[must_use]
    pub fn new(pool: Arc<dyn DatabasePoolInterface>) -> Self {
        Self { pool }
    }
}

/// Database row representation of a describe job.
#[derive(Debug, FromRow)]
struct DescribeJobRow {
    id: i64,
    integration_id: String,
    provider_id: String,
    integration_type: String,
    resource_type: String,
    status: String,
    trigger_type: String,
    retry_count: i32,
    retryable: bool,
    parent_id: Option<i64>,
    created_by: String,
    queue_seq: Option<i64>,
    queued_at: Option<DateTime<Utc>>,
    failure_message: Option<String>,
    error_code: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DescribeJobRow> for DescribeJob {
    type Error = VigilError;

    fn try_from(row: DescribeJobRow) -> Result<Self, Self::Error> {
        Ok(DescribeJob {
            id: DescribeJobId::new(row.id),
            integration_id: row.integration_id,
            provider_id: row.provider_id,
            integration_type: row.integration_type,
            resource_type: row.resource_type,
            status: row.status.parse()?,
            trigger_type: row.trigger_type.parse()?,
            retry_count: retry_from_db(row.retry_count)?,
            retryable: row.retryable,
            parent_id: row.parent_id,
            created_by: row.created_by,
            queue_seq: seq_from_db(row.queue_seq)?,
            queued_at: row.queued_at,
            failure_message: row.failure_message,
            error_code: row.error_code,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_jobs(rows: Vec<DescribeJobRow>) -> VigilResult<Vec<DescribeJob>> {
    rows.into_iter().map(DescribeJob::try_from).collect()
}

#[async_trait]
impl DescribeJobStore for PgDescribeJobStore {
    async fn create_describe_job(&self, job: &NewDescribeJob) -> VigilResult<DescribeJob> {
        debug!(
            integration_id = %job.integration_id,
            resource_type = %job.resource_type,
            "Creating describe job"
        );

        let sql = format!(
            r#"
            INSERT INTO describe_jobs
                (integration_id, provider_id, integration_type, resource_type, status,
                 trigger_type, parent_id, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, DescribeJobRow>(&sql)
            .bind(&job.integration_id)
            .bind(&job.provider_id)
            .bind(&job.integration_type)
            .bind(&job.resource_type)
            .bind(job.status.as_str())
            .bind(job.trigger_type.as_str())
            .bind(job.parent_id)
            .bind(&job.created_by)
            .fetch_one(self.pool.inner())
            .await?;

        DescribeJob::try_from(row)
    }

    async fn get_describe_job(&self, id: DescribeJobId) -> VigilResult<Option<DescribeJob>> {
        let sql = format!("SELECT {COLUMNS} FROM describe_jobs WHERE id = $1");
        let row = sqlx::query_as::<_, DescribeJobRow>(&sql)
            .bind(id.into_inner())
            .fetch_optional(self.pool.inner())
            .await?;

        row.map(DescribeJob::try_from).transpose()
    }

    async fn get_last_describe_job(
        &self,
        integration_id: &str,
        resource_type: &str,
    ) -> VigilResult<Option<DescribeJob>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM describe_jobs
            WHERE integration_id = $1 AND resource_type = $2
            ORDER BY id DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query_as::<_, DescribeJobRow>(&sql)
            .bind(integration_id)
            .bind(resource_type)
            .fetch_optional(self.pool.inner())
            .await?;

        row.map(DescribeJob::try_from).transpose()
    }

    async fn list_created_jobs(&self, limit: u32, lane: Lane) -> VigilResult<Vec<DescribeJob>> {
        debug!(limit, %lane, "Listing created describe jobs");

        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM describe_jobs
            WHERE status = $1 AND trigger_type = ANY($2)
            ORDER BY retry_count ASC, id ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query_as::<_, DescribeJobRow>(&sql)
            .bind(DescribeJobStatus::Created.as_str())
            .bind(lane_triggers(lane))
            .bind(i64::from(limit))
            .fetch_all(self.pool.inner())
            .await?;

        into_jobs(rows)
    }

    async fn count_running_per_resource_type(&self) -> VigilResult<HashMap<String, u64>> {
        let running = state_strs(
            DescribeJobStatus::all()
                .iter()
                .copied()
                .filter(|s| s.is_running()),
        );
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT resource_type, COUNT(*)
            FROM describe_jobs
            WHERE status = ANY($1)
            GROUP BY resource_type
            "#,
        )
        .bind(running)
        .fetch_all(self.pool.inner())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(resource_type, count)| (resource_type, count.max(0).unsigned_abs()))
            .collect())
    }

    async fn count_queued_jobs(&self) -> VigilResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM describe_jobs WHERE status = $1")
            .bind(DescribeJobStatus::Queued.as_str())
            .fetch_one(self.pool.inner())
            .await?;
        Ok(count.max(0).unsigned_abs())
    }

    async fn count_queued_since(&self, since: DateTime<Utc>) -> VigilResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM describe_jobs WHERE queued_at >= $1")
                .bind(since)
                .fetch_one(self.pool.inner())
                .await?;
        Ok(count.max(0).unsigned_abs())
    }

    async fn mark_queued(&self, id: DescribeJobId, seq: SequenceNumber) -> VigilResult<bool> {
        debug!(job_id = %id, %seq, "Marking describe job queued");

        let result = sqlx::query(
            r#"
            UPDATE describe_jobs
            SET status = $2, queue_seq = $3, queued_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id.into_inner())
        .bind(DescribeJobStatus::Queued.as_str())
        .bind(seq_to_db(seq)?)
        .bind(DescribeJobStatus::predecessor_strs(DescribeJobStatus::Queued))
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_in_progress(&self, id: DescribeJobId, retry_count: u32) -> VigilResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE describe_jobs
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND retry_count = $3 AND status = ANY($4)
            "#,
        )
        .bind(id.into_inner())
        .bind(DescribeJobStatus::InProgress.as_str())
        .bind(retry_to_db(retry_count))
        .bind(DescribeJobStatus::predecessor_strs(DescribeJobStatus::InProgress))
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_describe_job(
        &self,
        id: DescribeJobId,
        retry_count: u32,
        status: DescribeJobStatus,
        failure_message: Option<&str>,
        error_code: Option<&str>,
    ) -> VigilResult<bool> {
        debug!(job_id = %id, retry_count, %status, "Completing describe job");

        let result = sqlx::query(
            r#"
            UPDATE describe_jobs
            SET status = $2, failure_message = $3, error_code = $4, updated_at = NOW()
            WHERE id = $1 AND retry_count = $5 AND status = ANY($6)
            "#,
        )
        .bind(id.into_inner())
        .bind(status.as_str())
        .bind(failure_message)
        .bind(error_code)
        .bind(retry_to_db(retry_count))
        .bind(DescribeJobStatus::predecessor_strs(status))
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_describe_job(
        &self,
        id: DescribeJobId,
        message: &str,
        retryable: bool,
    ) -> VigilResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE describe_jobs
            SET status = $2, failure_message = $3, retryable = $4, updated_at = NOW()
            WHERE id = $1 AND status = ANY($5)
            "#,
        )
        .bind(id.into_inner())
        .bind(DescribeJobStatus::Failed.as_str())
        .bind(message)
        .bind(retryable)
        .bind(DescribeJobStatus::predecessor_strs(DescribeJobStatus::Failed))
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn retry_failed_jobs(&self, max_retries: u32) -> VigilResult<RetrySweep> {
        let mut tx = self.pool.inner().begin().await?;

        let exhausted = sqlx::query(
            r#"
            UPDATE describe_jobs
            SET status = $1, updated_at = NOW()
            WHERE status = $2 AND (retry_count >= $3 OR NOT retryable)
            "#,
        )
        .bind(DescribeJobStatus::Failed.as_str())
        .bind(DescribeJobStatus::TimedOut.as_str())
        .bind(retry_to_db(max_retries))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Only the latest job of a pair is retried; an older failure was
        // already superseded by a newer attempt.
        let retried = sqlx::query(
            r#"
            UPDATE describe_jobs j
            SET status = $1, retry_count = j.retry_count + 1, queue_seq = NULL,
                queued_at = NULL, failure_message = NULL, error_code = NULL, updated_at = NOW()
            WHERE j.status = ANY($2)
              AND j.retryable
              AND j.retry_count < $3
              AND j.id = (
                  SELECT MAX(l.id) FROM describe_jobs l
                  WHERE l.integration_id = j.integration_id
                    AND l.resource_type = j.resource_type
              )
            "#,
        )
        .bind(DescribeJobStatus::Created.as_str())
        .bind(DescribeJobStatus::predecessor_strs(DescribeJobStatus::Created))
        .bind(retry_to_db(max_retries))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        Ok(RetrySweep { retried, exhausted })
    }

    async fn time_out_stale_jobs(&self, before: DateTime<Utc>) -> VigilResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE describe_jobs
            SET status = $1, failure_message = 'job timed out', updated_at = NOW()
            WHERE status = ANY($2) AND updated_at < $3
            "#,
        )
        .bind(DescribeJobStatus::TimedOut.as_str())
        .bind(DescribeJobStatus::predecessor_strs(DescribeJobStatus::TimedOut))
        .bind(before)
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_removing_resources_jobs(&self, limit: u32) -> VigilResult<Vec<DescribeJob>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM describe_jobs WHERE status = $1 ORDER BY id ASC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, DescribeJobRow>(&sql)
            .bind(DescribeJobStatus::RemovingResources.as_str())
            .bind(i64::from(limit))
            .fetch_all(self.pool.inner())
            .await?;

        into_jobs(rows)
    }

    async fn cancel_jobs_for_integration(&self, integration_id: &str) -> VigilResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE describe_jobs
            SET status = $1, failure_message = 'integration disabled', updated_at = NOW()
            WHERE integration_id = $2 AND status = ANY($3)
            "#,
        )
        .bind(DescribeJobStatus::Canceled.as_str())
        .bind(integration_id)
        .bind(non_terminal_strs::<DescribeJobStatus>())
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_jobs_older_than(&self, before: DateTime<Utc>) -> VigilResult<u64> {
        let result =
            sqlx::query("DELETE FROM describe_jobs WHERE status = ANY($1) AND updated_at < $2")
                .bind(terminal_strs::<DescribeJobStatus>())
                .bind(before)
                .execute(self.pool.inner())
                .await?;

        Ok(result.rows_affected())
    }
}
