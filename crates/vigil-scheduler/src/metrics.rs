//! Prometheus metrics for the scheduling loops.
//!
//! Operators read admission pressure from the `publishing_blocked` gauge and
//! per-reason dispatch failures from the dispatched counter.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the scheduler.
pub mod names {
    /// 1 while an admission ceiling blocks describe publishing.
    pub const DESCRIBE_PUBLISHING_BLOCKED: &str = "vigil_describe_publishing_blocked";
    /// Dispatch outcomes of describe jobs.
    pub const DESCRIBE_JOBS_DISPATCHED_TOTAL: &str = "vigil_describe_jobs_dispatched_total";
    /// Describe jobs created by the create phase or on request.
    pub const DESCRIBE_JOBS_CREATED_TOTAL: &str = "vigil_describe_jobs_created_total";
    /// Candidates deferred by a resource type ceiling.
    pub const DESCRIBE_JOBS_DEFERRED_TOTAL: &str = "vigil_describe_jobs_deferred_total";
    /// Publish outcomes of compliance runners.
    pub const RUNNERS_PUBLISHED_TOTAL: &str = "vigil_compliance_runners_published_total";
    /// Result messages handled by the consumers.
    pub const RESULTS_PROCESSED_TOTAL: &str = "vigil_results_processed_total";
    /// Records reclaimed or removed by a sweeper.
    pub const SWEEPER_RECLAIMED_TOTAL: &str = "vigil_sweeper_reclaimed_total";
    /// 1 while this instance holds the leader lock.
    pub const SCHEDULER_IS_LEADER: &str = "vigil_scheduler_is_leader";
    /// Duration of one loop iteration.
    pub const CYCLE_DURATION_SECONDS: &str = "vigil_scheduler_cycle_duration_seconds";
}

/// Dispatch failure reasons.
pub mod reasons {
    pub const QUEUE_LENGTH: &str = "queue_length";
    pub const LAST_HOUR_LENGTH: &str = "last_hour_length";
    pub const FETCH_ERROR: &str = "fetch_error";
    pub const RESOURCE_TYPE_COUNT: &str = "resource_type_count";
    pub const GET_INTEGRATION: &str = "get_integration";
    pub const GET_CREDENTIAL: &str = "get_credential";
    pub const ENQUEUE: &str = "enqueue";
    pub const QUERY_NOT_FOUND: &str = "query_not_found";
    pub const CONNECTION_NOT_FOUND: &str = "connection_not_found";
    pub const MALFORMED: &str = "malformed";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_gauge!(
        names::DESCRIBE_PUBLISHING_BLOCKED,
        "Whether an admission ceiling currently blocks describe publishing"
    );
    describe_counter!(
        names::DESCRIBE_JOBS_DISPATCHED_TOTAL,
        "Describe job dispatch outcomes by status and reason"
    );
    describe_counter!(
        names::DESCRIBE_JOBS_CREATED_TOTAL,
        "Total number of describe jobs created"
    );
    describe_counter!(
        names::DESCRIBE_JOBS_DEFERRED_TOTAL,
        "Describe job candidates deferred by a resource type ceiling"
    );
    describe_counter!(
        names::RUNNERS_PUBLISHED_TOTAL,
        "Compliance runner publish outcomes by status and reason"
    );
    describe_counter!(
        names::RESULTS_PROCESSED_TOTAL,
        "Result messages handled by family and outcome"
    );
    describe_counter!(
        names::SWEEPER_RECLAIMED_TOTAL,
        "Records timed out, reset or deleted by a sweeper"
    );
    describe_gauge!(
        names::SCHEDULER_IS_LEADER,
        "Whether this instance holds the scheduler leader lock"
    );
    describe_histogram!(
        names::CYCLE_DURATION_SECONDS,
        "Duration of one scheduling loop iteration in seconds"
    );
}

/// Scheduler metrics recorder.
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    pub fn publishing_blocked(limiter: &'static str, blocked: bool) {
        gauge!(names::DESCRIBE_PUBLISHING_BLOCKED, "limiter" => limiter)
            .set(if blocked { 1.0 } else { 0.0 });
    }

    pub fn dispatch_succeeded() {
        counter!(
            names::DESCRIBE_JOBS_DISPATCHED_TOTAL,
            "status" => "successful",
            "reason" => ""
        )
        .increment(1);
    }

    pub fn dispatch_failed(reason: &'static str) {
        counter!(
            names::DESCRIBE_JOBS_DISPATCHED_TOTAL,
            "status" => "failure",
            "reason" => reason
        )
        .increment(1);
    }

    pub fn job_created(trigger: &'static str) {
        counter!(names::DESCRIBE_JOBS_CREATED_TOTAL, "trigger" => trigger).increment(1);
    }

    pub fn jobs_deferred(resource_type: &str, count: u64) {
        counter!(
            names::DESCRIBE_JOBS_DEFERRED_TOTAL,
            "resource_type" => resource_type.to_string()
        )
        .increment(count);
    }

    pub fn runner_published() {
        counter!(
            names::RUNNERS_PUBLISHED_TOTAL,
            "status" => "successful",
            "reason" => ""
        )
        .increment(1);
    }

    pub fn runner_failed(reason: &'static str) {
        counter!(
            names::RUNNERS_PUBLISHED_TOTAL,
            "status" => "failure",
            "reason" => reason
        )
        .increment(1);
    }

    pub fn result_processed(family: &'static str, outcome: &'static str) {
        counter!(
            names::RESULTS_PROCESSED_TOTAL,
            "family" => family,
            "outcome" => outcome
        )
        .increment(1);
    }

    pub fn swept(sweeper: &'static str, count: u64) {
        if count > 0 {
            counter!(names::SWEEPER_RECLAIMED_TOTAL, "sweeper" => sweeper).increment(count);
        }
    }

    pub fn set_leader(is_leader: bool) {
        gauge!(names::SCHEDULER_IS_LEADER).set(if is_leader { 1.0 } else { 0.0 });
    }

    pub fn cycle_duration(loop_name: &'static str, duration: Duration) {
        histogram!(names::CYCLE_DURATION_SECONDS, "loop" => loop_name)
            .record(duration.as_secs_f64());
    }
}
