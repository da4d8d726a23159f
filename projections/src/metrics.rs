//! Projection engine metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the host
//! application installs a recorder (for example `metrics-exporter-prometheus`).
//! Call [`describe_metrics`] once after installing it to attach help text.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

/// Targets processed, by read model and outcome.
pub const TARGETS_TOTAL: &str = "projection_targets_total";
/// Optimistic concurrency conflicts hit while storing.
pub const CONFLICTS_TOTAL: &str = "projection_conflicts_total";
/// Targets that failed after exhausting their attempts.
pub const RETRIES_EXHAUSTED_TOTAL: &str = "projection_retries_exhausted_total";
/// Wall time of one target, retries included.
pub const TARGET_DURATION_SECONDS: &str = "projection_target_duration_seconds";
/// Entity snapshots projected.
pub const SNAPSHOTS_TOTAL: &str = "projection_snapshots_total";

/// Register all metric descriptions.
pub fn describe_metrics() {
    describe_counter!(
        TARGETS_TOTAL,
        "Total number of read model targets processed, labelled by outcome"
    );
    describe_counter!(
        CONFLICTS_TOTAL,
        "Total number of optimistic concurrency conflicts while storing read models"
    );
    describe_counter!(
        RETRIES_EXHAUSTED_TOTAL,
        "Total number of targets that gave up after the maximum number of attempts"
    );
    describe_histogram!(
        TARGET_DURATION_SECONDS,
        "Time taken to project one read model target, retries included"
    );
    describe_counter!(SNAPSHOTS_TOTAL, "Total number of entity snapshots projected");
}

pub(crate) fn record_snapshot(entity_type_name: &str) {
    counter!(SNAPSHOTS_TOTAL, "entity" => entity_type_name.to_string()).increment(1);
}

pub(crate) fn record_target(read_model_name: &str, outcome: &'static str, duration: Duration) {
    counter!(
        TARGETS_TOTAL,
        "read_model" => read_model_name.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(TARGET_DURATION_SECONDS, "read_model" => read_model_name.to_string())
        .record(duration.as_secs_f64());
}

pub(crate) fn record_conflict(read_model_name: &str) {
    counter!(CONFLICTS_TOTAL, "read_model" => read_model_name.to_string()).increment(1);
}

pub(crate) fn record_retries_exhausted(read_model_name: &str) {
    counter!(RETRIES_EXHAUSTED_TOTAL, "read_model" => read_model_name.to_string()).increment(1);
}
