//! Prometheus metrics for the work queue.

use metrics::{counter, describe_counter};

/// Metric names for the work queue.
pub mod names {
    /// Messages appended to a topic.
    pub const PUBLISHED_TOTAL: &str = "vigil_queue_published_total";
    /// Publishes rejected as duplicates inside the dedup window.
    pub const DUPLICATES_TOTAL: &str = "vigil_queue_duplicates_total";
    /// Deliveries acknowledged.
    pub const ACKED_TOTAL: &str = "vigil_queue_acked_total";
    /// Deliveries negatively acknowledged.
    pub const NACKED_TOTAL: &str = "vigil_queue_nacked_total";
    /// Expired deliveries handed out again.
    pub const REDELIVERED_TOTAL: &str = "vigil_queue_redelivered_total";
    /// Deliveries dropped after reaching their delivery limit.
    pub const DROPPED_TOTAL: &str = "vigil_queue_dropped_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::PUBLISHED_TOTAL, "Total number of messages published");
    describe_counter!(
        names::DUPLICATES_TOTAL,
        "Total number of publishes deduplicated inside the window"
    );
    describe_counter!(names::ACKED_TOTAL, "Total number of deliveries acknowledged");
    describe_counter!(
        names::NACKED_TOTAL,
        "Total number of deliveries negatively acknowledged"
    );
    describe_counter!(
        names::REDELIVERED_TOTAL,
        "Total number of expired deliveries redelivered"
    );
    describe_counter!(
        names::DROPPED_TOTAL,
        "Total number of deliveries dropped after the delivery limit"
    );
}

/// Queue metrics recorder.
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn published(topic: &str) {
        counter!(names::PUBLISHED_TOTAL, "topic" => topic.to_string()).increment(1);
    }

    pub fn duplicate(topic: &str) {
        counter!(names::DUPLICATES_TOTAL, "topic" => topic.to_string()).increment(1);
    }

    pub fn acked(topic: &str) {
        counter!(names::ACKED_TOTAL, "topic" => topic.to_string()).increment(1);
    }

    pub fn nacked(topic: &str) {
        counter!(names::NACKED_TOTAL, "topic" => topic.to_string()).increment(1);
    }

    pub fn redelivered(topic: &str, count: u64) {
        counter!(names::REDELIVERED_TOTAL, "topic" => topic.to_string()).increment(count);
    }

    pub fn dropped(topic: &str) {
        counter!(names::DROPPED_TOTAL, "topic" => topic.to_string()).increment(1);
    }
}
