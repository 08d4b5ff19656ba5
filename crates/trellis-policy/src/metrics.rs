//! Metric names and recording helpers for the tick evaluator.
//!
//! All metrics go through the `metrics` facade; the embedding process
//! installs whatever recorder it wants. Names are centralized here so
//! dashboards and alerts have one place to look.

/// Metric name constants.
pub mod names {
    /// Counter: ticks evaluated.
    pub const TICKS_TOTAL: &str = "trellis_ticks_total";
    /// Counter: assets evaluated, across all ticks.
    pub const ASSETS_EVALUATED_TOTAL: &str = "trellis_assets_evaluated_total";
    /// Counter: asset partitions by final decision, labeled by
    /// [`labels::DECISION`].
    pub const PARTITIONS_DECIDED_TOTAL: &str = "trellis_partitions_decided_total";
    /// Counter: run requests produced.
    pub const RUN_REQUESTS_TOTAL: &str = "trellis_run_requests_total";
    /// Counter: evaluation records persisted.
    pub const EVALUATIONS_PERSISTED_TOTAL: &str = "trellis_evaluations_persisted_total";
    /// Counter: evaluation records suppressed as equivalent to the stored
    /// record.
    pub const EVALUATIONS_SUPPRESSED_TOTAL: &str = "trellis_evaluations_suppressed_total";
}

/// Metric label keys.
pub mod labels {
    /// The final decision for a partition: `requested`, `skipped`, or
    /// `discarded`.
    pub const DECISION: &str = "decision";
}

pub(crate) fn record_tick(
    num_assets: u64,
    num_requested: u64,
    num_skipped: u64,
    num_discarded: u64,
    num_run_requests: u64,
) {
    metrics::counter!(names::TICKS_TOTAL).increment(1);
    metrics::counter!(names::ASSETS_EVALUATED_TOTAL).increment(num_assets);
    metrics::counter!(names::PARTITIONS_DECIDED_TOTAL, labels::DECISION => "requested")
        .increment(num_requested);
    metrics::counter!(names::PARTITIONS_DECIDED_TOTAL, labels::DECISION => "skipped")
        .increment(num_skipped);
    metrics::counter!(names::PARTITIONS_DECIDED_TOTAL, labels::DECISION => "discarded")
        .increment(num_discarded);
    metrics::counter!(names::RUN_REQUESTS_TOTAL).increment(num_run_requests);
}

pub(crate) fn record_persistence(num_persisted: u64, num_suppressed: u64) {
    metrics::counter!(names::EVALUATIONS_PERSISTED_TOTAL).increment(num_persisted);
    metrics::counter!(names::EVALUATIONS_SUPPRESSED_TOTAL).increment(num_suppressed);
}
