//! Observability metrics for orchestration.
//!
//! Process-level metrics exposed via the `metrics` crate facade. These are
//! distinct from the per-event timeseries sink: the timeseries records one
//! dimensioned row per transition for reporting, while these counters and
//! histograms feed dashboards and alerting.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `stratus_flow_transitions_total` | Counter | `state` | State transitions recorded |
//! | `stratus_flow_dispatches_total` | Counter | `result` | Dispatch outcomes |
//! | `stratus_flow_events_total` | Counter | `event_kind` | Events announced |
//! | `stratus_flow_batch_size` | Histogram | - | Payloads per processed batch |
//! | `stratus_flow_dispatch_duration_seconds` | Histogram | `result` | End-to-end dispatch latency |
//!
//! ## Integration
//!
//! Metrics are exposed via the `metrics` crate facade. To export to Prometheus:
//!
//! ```rust,ignore
//! use metrics_exporter_prometheus::PrometheusBuilder;
//!
//! PrometheusBuilder::new()
//!     .with_http_listener(([0, 0, 0, 0], 9090))
//!     .install()
//!     .expect("failed to install Prometheus recorder");
//! ```

use std::time::Duration;

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: State transitions recorded, by target state.
    pub const TRANSITIONS_TOTAL: &str = "stratus_flow_transitions_total";
    /// Counter: Dispatch outcomes.
    pub const DISPATCHES_TOTAL: &str = "stratus_flow_dispatches_total";
    /// Counter: Events announced, by kind.
    pub const EVENTS_TOTAL: &str = "stratus_flow_events_total";
    /// Histogram: Payloads per processed batch.
    pub const BATCH_SIZE: &str = "stratus_flow_batch_size";
    /// Histogram: End-to-end dispatch latency in seconds.
    pub const DISPATCH_DURATION_SECONDS: &str = "stratus_flow_dispatch_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Target payload state (CLAIMED, PROCESSING, ...).
    pub const STATE: &str = "state";
    /// Dispatch result (started, skipped, failed).
    pub const RESULT: &str = "result";
    /// Event kind (claimed, duplicate, already_processing, ...).
    pub const EVENT_KIND: &str = "event_kind";
}

/// Dispatch result label values.
pub mod results {
    /// A new execution was started.
    pub const STARTED: &str = "started";
    /// The dispatch resolved to a benign skip.
    pub const SKIPPED: &str = "skipped";
    /// The dispatch raised an error.
    pub const FAILED: &str = "failed";
}

/// High-level interface for recording orchestration metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics {
    _private: (),
}

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a state transition.
    pub fn record_transition(&self, state: &str) {
        counter!(
            names::TRANSITIONS_TOTAL,
            labels::STATE => state.to_string(),
        )
        .increment(1);
    }

    /// Records a dispatch outcome.
    pub fn record_dispatch(&self, result: &str) {
        counter!(
            names::DISPATCHES_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records one announced event.
    pub fn record_event(&self, kind: &str) {
        counter!(
            names::EVENTS_TOTAL,
            labels::EVENT_KIND => kind.to_string(),
        )
        .increment(1);
    }

    /// Records the size of a processed batch.
    #[allow(clippy::cast_precision_loss)] // Batch sizes are small
    pub fn observe_batch_size(&self, size: usize) {
        histogram!(names::BATCH_SIZE).record(size as f64);
    }

    /// Records end-to-end dispatch latency.
    pub fn observe_dispatch_duration(&self, result: &str, duration: Duration) {
        histogram!(
            names::DISPATCH_DURATION_SECONDS,
            labels::RESULT => result.to_string(),
        )
        .record(duration.as_secs_f64());
    }
}
