//! Job, runner and compliance job state machines.
//!
//! Every status is a closed enum with an explicit transition table. Stores
//! derive the allowed "from" states of a conditional update from the same
//! table, so a status change the table rejects never reaches a row.

use crate::{VigilError, VigilResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Shared behaviour of the status enums.
pub trait JobState: Copy + Eq + fmt::Display + Sized + 'static {
    /// Entity name used in transition errors.
    const ENTITY: &'static str;

    /// Every state, in declaration order.
    fn all() -> &'static [Self];

    /// Returns the wire / storage representation.
    fn as_str(self) -> &'static str;

    /// True once no worker will touch the record again without a retry.
    fn is_terminal(self) -> bool;

    /// True if the transition table allows `self -> next`.
    fn can_transition_to(self, next: Self) -> bool;

    /// Validates `self -> next`, failing loudly on a transition the table
    /// does not contain.
    fn transition(self, next: Self) -> VigilResult<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(VigilError::InvalidTransition {
                entity: Self::ENTITY,
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }

    /// States from which `next` is reachable in one step.
    fn predecessors(next: Self) -> Vec<Self> {
        Self::all()
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }

    /// Storage strings of [`predecessors`](Self::predecessors), for SQL `= ANY($n)` binds.
    fn predecessor_strs(next: Self) -> Vec<String> {
        Self::predecessors(next)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect()
    }
}

fn parse_state<S: JobState>(s: &str) -> VigilResult<S> {
    S::all()
        .iter()
        .copied()
        .find(|state| state.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| VigilError::data_integrity(format!("unknown {} status: {}", S::ENTITY, s)))
}

// ============================================================================
// Describe jobs
// ============================================================================

/// Status of a describe (discovery) job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DescribeJobStatus {
    /// Row inserted, not yet published.
    #[default]
    Created,
    /// Published; the queue returned a sequence number.
    Queued,
    /// A worker reported progress.
    InProgress,
    /// Discovery finished; the worker is deleting resources no longer present.
    OldResourceDeletion,
    /// Cleanup job whose purpose is deleting previously described resources.
    RemovingResources,
    /// Finished successfully.
    Succeeded,
    /// Failed; retry eligible while the retry counter allows.
    Failed,
    /// Reclaimed by the timeout sweep; retry eligible.
    #[serde(rename = "TIMEOUT")]
    TimedOut,
    /// Canceled by an operator or by disabled-integration cleanup.
    Canceled,
}

impl DescribeJobStatus {
    /// States that count against a resource type's concurrency ceiling.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Queued | Self::InProgress)
    }

    /// Non-terminal states. At most one per (integration, resource type) pair.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Created
                | Self::Queued
                | Self::InProgress
                | Self::OldResourceDeletion
                | Self::RemovingResources
        )
    }

    /// Failed and timed out jobs may be reset to `Created`.
    #[must_use]
    pub const fn is_retry_eligible(self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    /// States a describe worker may report. The rest belong to the scheduler.
    #[must_use]
    pub const fn is_worker_reported(self) -> bool {
        matches!(
            self,
            Self::InProgress
                | Self::OldResourceDeletion
                | Self::Succeeded
                | Self::Failed
                | Self::TimedOut
        )
    }
}

impl JobState for DescribeJobStatus {
    const ENTITY: &'static str = "describe job";

    fn all() -> &'static [Self] {
        &[
            Self::Created,
            Self::Queued,
            Self::InProgress,
            Self::OldResourceDeletion,
            Self::RemovingResources,
            Self::Succeeded,
            Self::Failed,
            Self::TimedOut,
            Self::Canceled,
        ]
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::OldResourceDeletion => "OLD_RESOURCE_DELETION",
            Self::RemovingResources => "REMOVING_RESOURCES",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMEOUT",
            Self::Canceled => "CANCELED",
        }
    }

    fn is_terminal(self) -> bool {
        !self.is_in_flight()
    }

    fn can_transition_to(self, next: Self) -> bool {
        use DescribeJobStatus::{
            Canceled, Created, Failed, InProgress, OldResourceDeletion, Queued, RemovingResources,
            Succeeded, TimedOut,
        };
        matches!(
            (self, next),
            (Created, Queued | Failed | Canceled)
                | (
                    Queued | InProgress,
                    InProgress | OldResourceDeletion | Succeeded | Failed | TimedOut | Canceled
                )
                | (OldResourceDeletion, Succeeded | Failed | TimedOut | Canceled)
                | (RemovingResources, Succeeded | Failed | Canceled)
                | (Failed | TimedOut, Created)
                | (TimedOut, Failed)
        )
    }
}

impl fmt::Display for DescribeJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DescribeJobStatus {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_state(s)
    }
}

// ============================================================================
// Compliance runners
// ============================================================================

/// Status of a compliance runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerStatus {
    /// Row inserted, not yet published.
    #[default]
    Created,
    /// Published; the queue returned a sequence number.
    Queued,
    /// The runner worker reported progress (also used as heartbeat).
    InProgress,
    /// Finished successfully.
    Succeeded,
    /// Failed; retry eligible unless flagged otherwise.
    Failed,
    /// Reclaimed by the timeout sweep; retry eligible.
    #[serde(rename = "TIMEOUT")]
    TimedOut,
    /// Canceled.
    Canceled,
}

impl RunnerStatus {
    /// States a runner worker may report. The rest belong to the scheduler.
    #[must_use]
    pub const fn is_worker_reported(self) -> bool {
        matches!(
            self,
            Self::InProgress | Self::Succeeded | Self::Failed | Self::TimedOut
        )
    }
}

impl JobState for RunnerStatus {
    const ENTITY: &'static str = "compliance runner";

    fn all() -> &'static [Self] {
        &[
            Self::Created,
            Self::Queued,
            Self::InProgress,
            Self::Succeeded,
            Self::Failed,
            Self::TimedOut,
            Self::Canceled,
        ]
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMEOUT",
            Self::Canceled => "CANCELED",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Canceled
        )
    }

    fn can_transition_to(self, next: Self) -> bool {
        use RunnerStatus::{Canceled, Created, Failed, InProgress, Queued, Succeeded, TimedOut};
        matches!(
            (self, next),
            (Created, Queued | Failed | Canceled)
                | (Queued | InProgress, InProgress | Succeeded | Failed | TimedOut | Canceled)
                | (Failed | TimedOut, Created)
                | (TimedOut, Failed)
        )
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerStatus {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_state(s)
    }
}

// ============================================================================
// Compliance jobs
// ============================================================================

/// Status of a compliance job (one benchmark evaluation run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceJobStatus {
    #[default]
    Created,
    RunnersInProgress,
    /// All runners are terminal; findings are being sunk and summarized.
    SinkInProgress,
    SummarizerInProgress,
    Failed,
    Succeeded,
    #[serde(rename = "TIMEOUT")]
    TimedOut,
    Canceled,
}

impl JobState for ComplianceJobStatus {
    const ENTITY: &'static str = "compliance job";

    fn all() -> &'static [Self] {
        &[
            Self::Created,
            Self::RunnersInProgress,
            Self::SinkInProgress,
            Self::SummarizerInProgress,
            Self::Failed,
            Self::Succeeded,
            Self::TimedOut,
            Self::Canceled,
        ]
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::RunnersInProgress => "RUNNERS_IN_PROGRESS",
            Self::SinkInProgress => "SINK_IN_PROGRESS",
            Self::SummarizerInProgress => "SUMMARIZER_IN_PROGRESS",
            Self::Failed => "FAILED",
            Self::Succeeded => "SUCCEEDED",
            Self::TimedOut => "TIMEOUT",
            Self::Canceled => "CANCELED",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Canceled
        )
    }

    fn can_transition_to(self, next: Self) -> bool {
        use ComplianceJobStatus::{
            Canceled, Created, Failed, RunnersInProgress, SinkInProgress, Succeeded,
            SummarizerInProgress, TimedOut,
        };
        matches!(
            (self, next),
            (Created, RunnersInProgress | Failed | Canceled)
                | (RunnersInProgress, SinkInProgress | Failed | TimedOut | Canceled)
                | (SinkInProgress, SummarizerInProgress | Failed | TimedOut | Canceled)
                | (SummarizerInProgress, Succeeded | Failed | TimedOut | Canceled)
        )
    }
}

impl fmt::Display for ComplianceJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplianceJobStatus {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_state(s)
    }
}
