//! Compliance jobs, runners, callers and the query catalog entry they run.

use super::status::{ComplianceJobStatus, JobState, RunnerStatus};
use super::trigger::TriggerType;
use crate::{ComplianceJobId, RunnerId, SequenceNumber, VigilError, VigilResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Benchmark and control context that required a runner's query.
///
/// One query can back controls under several benchmarks, so a runner holds
/// an ordered list of callers and its result is fanned out to each.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    #[serde(rename = "RootBenchmark")]
    pub root_benchmark: String,
    #[serde(rename = "ControlID")]
    pub control_id: String,
    #[serde(rename = "ControlSeverity")]
    pub control_severity: String,
}

impl Caller {
    #[must_use]
    pub fn new(
        root_benchmark: impl Into<String>,
        control_id: impl Into<String>,
        control_severity: impl Into<String>,
    ) -> Self {
        Self {
            root_benchmark: root_benchmark.into(),
            control_id: control_id.into(),
            control_severity: control_severity.into(),
        }
    }
}

/// Decodes a stored caller list once, at load time.
pub fn decode_callers(raw: &serde_json::Value) -> VigilResult<Vec<Caller>> {
    let callers: Vec<Caller> = serde_json::from_value(raw.clone())
        .map_err(|e| VigilError::data_integrity(format!("failed to parse callers: {e}")))?;
    if callers.is_empty() {
        return Err(VigilError::data_integrity("runner has no callers"));
    }
    Ok(callers)
}

/// One evaluation task: one query against one connection (or a resource
/// collection) within a compliance job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRunner {
    pub id: RunnerId,
    pub parent_job_id: ComplianceJobId,
    /// Benchmark (framework) being evaluated.
    pub framework_id: String,
    pub query_id: String,
    pub integration_id: Option<String>,
    pub resource_collection_id: Option<String>,
    pub callers: Vec<Caller>,
    pub status: RunnerStatus,
    pub trigger_type: TriggerType,
    pub retry_count: u32,
    pub retryable: bool,
    pub queue_seq: Option<SequenceNumber>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub total_finding_count: Option<i64>,
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ComplianceRunner {
    /// Stable identity used in logs and to avoid creating the same runner twice.
    #[must_use]
    pub fn identity_key(&self) -> String {
        runner_identity_key(
            &self.framework_id,
            &self.query_id,
            self.integration_id.as_deref(),
            self.parent_job_id,
        )
    }

    /// Applies a validated status change in place.
    pub fn transition_to(&mut self, next: RunnerStatus) -> VigilResult<()> {
        self.status = self.status.transition(next)?;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// `{framework}-{query}-{connection|all}-{parent}`.
#[must_use]
pub fn runner_identity_key(
    framework_id: &str,
    query_id: &str,
    integration_id: Option<&str>,
    parent_job_id: ComplianceJobId,
) -> String {
    format!(
        "{}-{}-{}-{}",
        framework_id,
        query_id,
        integration_id.unwrap_or("all"),
        parent_job_id
    )
}

/// Insert payload for a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewComplianceRunner {
    pub parent_job_id: ComplianceJobId,
    pub framework_id: String,
    pub query_id: String,
    pub integration_id: Option<String>,
    pub resource_collection_id: Option<String>,
    pub callers: Vec<Caller>,
    pub trigger_type: TriggerType,
}

/// A runner row as loaded for publication.
///
/// Rows whose caller list cannot be decoded are surfaced rather than dropped
/// so the publisher can fail them.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerRecord {
    Valid(ComplianceRunner),
    Malformed {
        id: RunnerId,
        retry_count: u32,
        reason: String,
    },
}

impl RunnerRecord {
    #[must_use]
    pub fn id(&self) -> RunnerId {
        match self {
            Self::Valid(r) => r.id,
            Self::Malformed { id, .. } => *id,
        }
    }
}

/// One benchmark evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceJob {
    pub id: ComplianceJobId,
    pub framework_id: String,
    pub status: ComplianceJobStatus,
    pub integration_ids: Vec<String>,
    pub with_incidents: bool,
    pub include_results: Vec<String>,
    pub are_all_runners_queued: bool,
    pub trigger_type: TriggerType,
    pub parent_id: Option<i64>,
    pub created_by: String,
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a compliance job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewComplianceJob {
    pub framework_id: String,
    pub integration_ids: Vec<String>,
    pub with_incidents: bool,
    pub include_results: Vec<String>,
    pub trigger_type: TriggerType,
    pub parent_id: Option<i64>,
    pub created_by: String,
}

/// Query catalog entry a runner executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDefinition {
    pub id: String,
    pub query_to_execute: String,
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub primary_table: Option<String>,
    #[serde(default)]
    pub list_of_tables: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<QueryParameter>,
    #[serde(default)]
    pub integration_types: Vec<String>,
}

/// Named query parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParameter {
    pub key: String,
    #[serde(default)]
    pub required: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_key_with_and_without_connection() {
        let parent = ComplianceJobId::new(17);
        assert_eq!(
            runner_identity_key("cis-aws", "q-1", Some("i-9"), parent),
            "cis-aws-q-1-i-9-17"
        );
        assert_eq!(runner_identity_key("cis-aws", "q-1", None, parent), "cis-aws-q-1-all-17");
    }

    #[test]
    fn test_decode_callers() {
        let raw = json!([
            {"RootBenchmark": "cis", "ControlID": "c-1", "ControlSeverity": "high"},
            {"RootBenchmark": "soc2", "ControlID": "c-7", "ControlSeverity": "low"}
        ]);
        let callers = decode_callers(&raw).unwrap();
        assert_eq!(callers.len(), 2);
        assert_eq!(callers[1], Caller::new("soc2", "c-7", "low"));
    }

    #[test]
    fn test_decode_callers_rejects_garbage() {
        let err = decode_callers(&json!({"not": "a list"})).unwrap_err();
        assert!(err.is_data_integrity());
        let err = decode_callers(&json!([])).unwrap_err();
        assert!(err.is_data_integrity());
    }

    #[test]
    fn test_query_definition_defaults() {
        let q: QueryDefinition =
            serde_json::from_value(json!({"id": "q-1", "queryToExecute": "select 1"})).unwrap();
        assert!(q.parameters.is_empty());
        assert_eq!(q.primary_table, None);
    }
}
