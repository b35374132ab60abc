//! Describe job entity.

use super::status::{DescribeJobStatus, JobState};
use super::trigger::TriggerType;
use crate::{DescribeJobId, SequenceNumber, VigilResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One discovery task for one integration and one resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescribeJob {
    pub id: DescribeJobId,
    /// Integration (connection) the resources are described from.
    pub integration_id: String,
    /// Provider-side account identifier of the integration.
    pub provider_id: String,
    /// Integration type, e.g. `aws_cloud_account`.
    pub integration_type: String,
    pub resource_type: String,
    pub status: DescribeJobStatus,
    pub trigger_type: TriggerType,
    pub retry_count: u32,
    /// False once a failure is known to be unfixable by retrying.
    pub retryable: bool,
    /// Parent job for derived or removal jobs.
    pub parent_id: Option<i64>,
    pub created_by: String,
    /// Sequence number returned by the work queue. `None` until published.
    pub queue_seq: Option<SequenceNumber>,
    pub queued_at: Option<DateTime<Utc>>,
    pub failure_message: Option<String>,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DescribeJob {
    /// Applies a validated status change in place.
    pub fn transition_to(&mut self, next: DescribeJobStatus) -> VigilResult<()> {
        self.status = self.status.transition(next)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Age of the last status change.
    #[must_use]
    pub fn since_update(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at
    }
}

/// Insert payload for a describe job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDescribeJob {
    pub integration_id: String,
    pub provider_id: String,
    pub integration_type: String,
    pub resource_type: String,
    pub status: DescribeJobStatus,
    pub trigger_type: TriggerType,
    pub parent_id: Option<i64>,
    pub created_by: String,
}

impl NewDescribeJob {
    /// A scheduled discovery in `Created`.
    #[must_use]
    pub fn scheduled(
        integration_id: impl Into<String>,
        provider_id: impl Into<String>,
        integration_type: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            integration_id: integration_id.into(),
            provider_id: provider_id.into(),
            integration_type: integration_type.into(),
            resource_type: resource_type.into(),
            status: DescribeJobStatus::Created,
            trigger_type: TriggerType::Scheduled,
            parent_id: None,
            created_by: "system".to_string(),
        }
    }

    #[must_use]
    pub fn with_trigger(mut self, trigger: TriggerType) -> Self {
        self.trigger_type = trigger;
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: DescribeJobStatus) -> Self {
        self.status = status;
        self
    }
}
