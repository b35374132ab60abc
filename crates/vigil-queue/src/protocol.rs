//! Wire protocol shared with the remote workers: topics, stream topology,
//! message envelopes and deduplication keys.
//!
//! Envelopes use the PascalCase field names the workers expect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use vigil_core::{
    Caller, ComplianceJobId, DescribeJobId, DescribeJobStatus, QueryDefinition, RunnerId,
    RunnerStatus, TriggerType,
};

/// Topic names.
pub mod topics {
    /// Manually triggered describe jobs.
    pub const DESCRIBE_JOBS_MANUALS: &str = "describe-jobs-manuals";
    /// Scheduled describe jobs.
    pub const DESCRIBE_JOBS: &str = "describe-jobs";
    /// Describe worker progress and results.
    pub const DESCRIBE_RESULTS: &str = "describe-results";

    /// Manually triggered compliance runners.
    pub const RUNNER_JOBS_MANUALS: &str = "compliance-runner-jobs-manuals";
    /// Scheduled compliance runners.
    pub const RUNNER_JOBS: &str = "compliance-runner-jobs";
    /// Runner worker progress and results.
    pub const RUNNER_RESULTS: &str = "compliance-runner-results";

    /// Jobs topic for a describe job's trigger.
    #[must_use]
    pub fn describe_jobs_for(trigger: vigil_core::TriggerType) -> &'static str {
        if trigger.is_manual() {
            DESCRIBE_JOBS_MANUALS
        } else {
            DESCRIBE_JOBS
        }
    }

    /// Jobs topic for a runner's trigger.
    #[must_use]
    pub fn runner_jobs_for(trigger: vigil_core::TriggerType) -> &'static str {
        if trigger.is_manual() {
            RUNNER_JOBS_MANUALS
        } else {
            RUNNER_JOBS
        }
    }
}

/// Deduplication keys.
///
/// The retry counter is part of every key: a retry of a job publishes under a
/// fresh key while a redelivery of the same attempt collides with the first.
pub mod dedup {
    use vigil_core::{DescribeJobId, RunnerId};

    /// `{integrationType}-{id}-{retry}`.
    #[must_use]
    pub fn describe_job(integration_type: &str, id: DescribeJobId, retry: u32) -> String {
        format!("{}-{}-{}", integration_type, id, retry)
    }

    /// `job-result-{id}-{retry}`.
    #[must_use]
    pub fn describe_result(id: DescribeJobId, retry: u32) -> String {
        format!("job-result-{}-{}", id, retry)
    }

    /// `job-inprogress-{id}-{retry}`.
    #[must_use]
    pub fn describe_in_progress(id: DescribeJobId, retry: u32) -> String {
        format!("job-inprogress-{}-{}", id, retry)
    }

    /// `job-{id}-{retry}`.
    #[must_use]
    pub fn runner_job(id: RunnerId, retry: u32) -> String {
        format!("job-{}-{}", id, retry)
    }

    /// `compliance-runner-inprogress-{id}-{retry}`.
    #[must_use]
    pub fn runner_in_progress(id: RunnerId, retry: u32) -> String {
        format!("compliance-runner-inprogress-{}-{}", id, retry)
    }

    /// `compliance-runner-result-{id}-{retry}`.
    #[must_use]
    pub fn runner_result(id: RunnerId, retry: u32) -> String {
        format!("compliance-runner-result-{}-{}", id, retry)
    }
}

/// A durable stream grouping related topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: &'static str,
    pub topics: &'static [&'static str],
    /// Approximate cap on retained entries per topic.
    pub max_len: Option<usize>,
}

impl StreamSpec {
    /// Describe jobs and results.
    #[must_use]
    pub const fn describe() -> Self {
        Self {
            name: "describe",
            topics: &[
                topics::DESCRIBE_JOBS_MANUALS,
                topics::DESCRIBE_JOBS,
                topics::DESCRIBE_RESULTS,
            ],
            max_len: None,
        }
    }

    /// Compliance runner jobs and results.
    #[must_use]
    pub const fn compliance_runner(max_len: usize) -> Self {
        Self {
            name: "compliance-runner",
            topics: &[
                topics::RUNNER_JOBS_MANUALS,
                topics::RUNNER_JOBS,
                topics::RUNNER_RESULTS,
            ],
            max_len: Some(max_len),
        }
    }
}

/// A durable consumer group reading one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    /// Consumer group name.
    pub group: String,
    /// Consumer name inside the group, unique per process.
    pub consumer: String,
    pub topic: String,
    /// Time a delivery may stay unacknowledged before it is redelivered.
    pub ack_wait: Duration,
    /// Deliveries per message, the first one included.
    pub max_deliver: u32,
}

impl ConsumerSpec {
    #[must_use]
    pub fn new(
        group: impl Into<String>,
        consumer: impl Into<String>,
        topic: impl Into<String>,
        ack_wait: Duration,
        max_deliver: u32,
    ) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            topic: topic.into(),
            ack_wait,
            max_deliver,
        }
    }
}

// ============================================================================
// Describe envelopes
// ============================================================================

/// Describe job published to the workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeJobMessage {
    #[serde(rename = "JobID")]
    pub job_id: DescribeJobId,
    #[serde(rename = "ParentJobID", default)]
    pub parent_job_id: Option<i64>,
    pub resource_type: String,
    #[serde(rename = "IntegrationID")]
    pub integration_id: String,
    #[serde(rename = "ProviderID")]
    pub provider_id: String,
    pub integration_type: String,
    pub trigger_type: TriggerType,
    pub retry_counter: u32,
    /// Where the worker delivers described resources.
    pub delivery_endpoint: String,
    /// Encrypted credential reference, opaque to the scheduler.
    pub cipher_text: String,
}

impl DescribeJobMessage {
    #[must_use]
    pub fn dedup_key(&self) -> String {
        dedup::describe_job(&self.integration_type, self.job_id, self.retry_counter)
    }
}

/// Progress report or final result of a describe job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeResultMessage {
    #[serde(rename = "JobID")]
    pub job_id: DescribeJobId,
    #[serde(rename = "ParentJobID", default)]
    pub parent_job_id: Option<i64>,
    pub status: DescribeJobStatus,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_code: String,
    /// The job as it was published.
    pub describe_job: DescribeJobMessage,
    #[serde(rename = "DescribedResourceIDs", default)]
    pub described_resource_ids: Vec<String>,
}

impl DescribeResultMessage {
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.describe_job.retry_counter
    }

    #[must_use]
    pub fn dedup_key(&self) -> String {
        if self.status == DescribeJobStatus::InProgress {
            dedup::describe_in_progress(self.job_id, self.retry_count())
        } else {
            dedup::describe_result(self.job_id, self.retry_count())
        }
    }
}

// ============================================================================
// Compliance runner envelopes
// ============================================================================

/// Everything a runner worker needs to evaluate one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionPlan {
    pub callers: Vec<Caller>,
    pub query: QueryDefinition,
    #[serde(rename = "IntegrationID", default)]
    pub integration_id: Option<String>,
    #[serde(rename = "ProviderID", default)]
    pub provider_id: Option<String>,
}

/// Compliance runner published to the workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunnerJobMessage {
    #[serde(rename = "ID")]
    pub id: RunnerId,
    pub retry_count: u32,
    #[serde(rename = "ParentJobID")]
    pub parent_job_id: ComplianceJobId,
    pub created_at: DateTime<Utc>,
    pub execution_plan: ExecutionPlan,
}

impl RunnerJobMessage {
    #[must_use]
    pub fn dedup_key(&self) -> String {
        dedup::runner_job(self.id, self.retry_count)
    }
}

/// Progress report or final result of a compliance runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunnerResultMessage {
    pub job: RunnerJobMessage,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub status: RunnerStatus,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub total_finding_count: Option<i64>,
    /// Per-resource outcomes of the query, attached to the final result.
    #[serde(default)]
    pub findings: Vec<RunnerFinding>,
}

/// Evaluation outcome of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    Ok,
    Alarm,
    Info,
    Skip,
    Error,
}

impl FindingStatus {
    /// Only passing and failing evaluations are recorded downstream.
    #[must_use]
    pub const fn is_recorded(self) -> bool {
        matches!(self, Self::Ok | Self::Alarm)
    }
}

/// One row of a runner's query result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunnerFinding {
    #[serde(rename = "ResourceID")]
    pub resource_id: String,
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub resource_location: String,
    /// Integration the resource belongs to, when the query reports it.
    #[serde(rename = "IntegrationID", default)]
    pub integration_id: Option<String>,
    pub status: FindingStatus,
    #[serde(default)]
    pub reason: String,
}

impl RunnerResultMessage {
    #[must_use]
    pub fn dedup_key(&self) -> String {
        if self.status == RunnerStatus::InProgress {
            dedup::runner_in_progress(self.job.id, self.job.retry_count)
        } else {
            dedup::runner_result(self.job.id, self.job.retry_count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn describe_message(retry: u32) -> DescribeJobMessage {
        DescribeJobMessage {
            job_id: DescribeJobId::new(42),
            parent_job_id: None,
            resource_type: "AWS::EC2::Instance".into(),
            integration_id: "i-1".into(),
            provider_id: "123456789012".into(),
            integration_type: "aws_cloud_account".into(),
            trigger_type: TriggerType::Scheduled,
            retry_counter: retry,
            delivery_endpoint: "http://localhost:8004".into(),
            cipher_text: "c2VjcmV0".into(),
        }
    }

    #[test]
    fn test_retries_get_distinct_dedup_keys() {
        let first = describe_message(0).dedup_key();
        let retry = describe_message(1).dedup_key();
        assert_eq!(first, "aws_cloud_account-42-0");
        assert_ne!(first, retry);
        assert_eq!(first, describe_message(0).dedup_key());
    }

    #[test]
    fn test_runner_dedup_keys() {
        let id = RunnerId::new(7);
        assert_eq!(dedup::runner_job(id, 2), "job-7-2");
        assert_eq!(dedup::runner_in_progress(id, 0), "compliance-runner-inprogress-7-0");
        assert_eq!(dedup::runner_result(id, 0), "compliance-runner-result-7-0");
        assert_eq!(dedup::describe_result(DescribeJobId::new(9), 1), "job-result-9-1");
    }

    #[test]
    fn test_manual_triggers_use_manual_topics() {
        assert_eq!(topics::describe_jobs_for(TriggerType::Manual), topics::DESCRIBE_JOBS_MANUALS);
        assert_eq!(
            topics::describe_jobs_for(TriggerType::CostFullDiscovery),
            topics::DESCRIBE_JOBS_MANUALS
        );
        assert_eq!(topics::runner_jobs_for(TriggerType::Scheduled), topics::RUNNER_JOBS);
    }

    #[test]
    fn test_describe_job_wire_names() {
        let value = serde_json::to_value(describe_message(3)).unwrap();
        assert_eq!(value["JobID"], json!(42));
        assert_eq!(value["IntegrationID"], json!("i-1"));
        assert_eq!(value["RetryCounter"], json!(3));
        assert_eq!(value["TriggerType"], json!("scheduled"));
    }

    #[test]
    fn test_describe_result_defaults() {
        let raw = json!({
            "JobID": 42,
            "Status": "SUCCEEDED",
            "DescribeJob": serde_json::to_value(describe_message(1)).unwrap(),
        });
        let result: DescribeResultMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(result.status, DescribeJobStatus::Succeeded);
        assert!(result.error.is_empty());
        assert!(result.described_resource_ids.is_empty());
        assert_eq!(result.dedup_key(), "job-result-42-1");
    }

    #[test]
    fn test_runner_result_in_progress_key() {
        let raw = json!({
            "Job": {
                "ID": 5,
                "RetryCount": 1,
                "ParentJobID": 2,
                "CreatedAt": "2024-01-01T00:00:00Z",
                "ExecutionPlan": {
                    "Callers": [{"RootBenchmark": "cis", "ControlID": "c-1", "ControlSeverity": "high"}],
                    "Query": {"id": "q-1", "queryToExecute": "select 1"}
                }
            },
            "Status": "IN_PROGRESS"
        });
        let result: RunnerResultMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(result.dedup_key(), "compliance-runner-inprogress-5-1");
        assert_eq!(result.job.execution_plan.callers.len(), 1);
        assert!(result.findings.is_empty());
    }

    #[test]
    fn test_finding_wire_names() {
        let finding: RunnerFinding = serde_json::from_value(json!({
            "ResourceID": "arn:aws:s3:::logs",
            "IntegrationID": "i-1",
            "Status": "alarm",
            "Reason": "bucket is public"
        }))
        .unwrap();
        assert_eq!(finding.status, FindingStatus::Alarm);
        assert!(finding.status.is_recorded());
        assert!(!FindingStatus::Skip.is_recorded());
        assert_eq!(finding.integration_id.as_deref(), Some("i-1"));
    }
}
