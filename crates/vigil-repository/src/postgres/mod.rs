//! Postgres job store implementations.

mod compliance_store;
mod describe_job_store;

pub use compliance_store::PgComplianceStore;
pub use describe_job_store::PgDescribeJobStore;

use vigil_core::{JobState, Lane, SequenceNumber, TriggerType, VigilError, VigilResult};

/// Storage strings of a set of states, for `status = ANY($n)` binds.
fn state_strs<S: JobState>(states: impl IntoIterator<Item = S>) -> Vec<String> {
    states.into_iter().map(|s| s.as_str().to_string()).collect()
}

/// Storage strings of every non-terminal state.
fn non_terminal_strs<S: JobState>() -> Vec<String> {
    state_strs(S::all().iter().copied().filter(|s| !s.is_terminal()))
}

/// Storage strings of every terminal state.
fn terminal_strs<S: JobState>() -> Vec<String> {
    state_strs(S::all().iter().copied().filter(|s| s.is_terminal()))
}

/// Trigger types carried by a lane.
fn lane_triggers(lane: Lane) -> Vec<String> {
    [
        TriggerType::Scheduled,
        TriggerType::Manual,
        TriggerType::CostFullDiscovery,
    ]
    .into_iter()
    .filter(|t| Lane::of(*t) == lane)
    .map(|t| t.as_str().to_string())
    .collect()
}

fn seq_to_db(seq: SequenceNumber) -> VigilResult<i64> {
    i64::try_from(seq.get())
        .map_err(|_| VigilError::internal(format!("sequence number {} out of range", seq)))
}

fn seq_from_db(seq: Option<i64>) -> VigilResult<Option<SequenceNumber>> {
    seq.map(|s| {
        u64::try_from(s)
            .map(SequenceNumber)
            .map_err(|_| VigilError::data_integrity(format!("negative sequence number {}", s)))
    })
    .transpose()
}

fn retry_from_db(retry_count: i32) -> VigilResult<u32> {
    u32::try_from(retry_count)
        .map_err(|_| VigilError::data_integrity(format!("negative retry count {}", retry_count)))
}

fn retry_to_db(retry_count: u32) -> i32 {
    i32::try_from(retry_count).unwrap_or(i32::MAX)
}
