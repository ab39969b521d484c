//! Observability metrics for the submission engine.
//!
//! Prometheus-compatible metrics exposed via the `metrics` crate facade;
//! binaries pick the exporter.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `dray_flow_submissions_total` | Counter | `state` | Submission state transitions |
//! | `dray_flow_dispatches_total` | Counter | `outcome`, `dispatcher` | Dispatch decisions |
//! | `dray_flow_dispatch_queue_depth` | Gauge | - | Pending submissions awaiting dispatch |
//! | `dray_flow_task_duration_seconds` | Histogram | `outcome` | Task run duration |
//! | `dray_flow_lease_sweeps_total` | Counter | `result` | Lease expiry sweep passes |
//! | `dray_flow_retries_total` | Counter | `reason` | Submissions requeued for retry |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dray_flow::metrics::EngineMetrics;
//!
//! let metrics = EngineMetrics::new();
//! metrics.record_transition("executing");
//! metrics.record_dispatch("accepted", "policy_routed");
//! metrics.set_queue_depth(5);
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Submission state transitions.
    pub const SUBMISSIONS_TOTAL: &str = "dray_flow_submissions_total";
    /// Counter: Dispatch decisions by outcome and dispatcher.
    pub const DISPATCHES_TOTAL: &str = "dray_flow_dispatches_total";
    /// Gauge: Pending submissions awaiting dispatch.
    pub const DISPATCH_QUEUE_DEPTH: &str = "dray_flow_dispatch_queue_depth";
    /// Histogram: Task run duration in seconds.
    pub const TASK_DURATION_SECONDS: &str = "dray_flow_task_duration_seconds";
    /// Counter: Lease expiry sweep passes.
    pub const LEASE_SWEEPS_TOTAL: &str = "dray_flow_lease_sweeps_total";
    /// Counter: Submissions requeued for retry.
    pub const RETRIES_TOTAL: &str = "dray_flow_retries_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Submission state after a transition.
    pub const STATE: &str = "state";
    /// Dispatch outcome (accepted, rejected, retry_later, abort).
    pub const OUTCOME: &str = "outcome";
    /// Dispatcher name.
    pub const DISPATCHER: &str = "dispatcher";
    /// Sweep result (fired, idle).
    pub const RESULT: &str = "result";
    /// Retry reason (lease_expired).
    pub const REASON: &str = "reason";
}

/// High-level interface for recording engine metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    _private: (),
}

impl EngineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a submission state transition.
    pub fn record_transition(&self, state: &str) {
        counter!(
            names::SUBMISSIONS_TOTAL,
            labels::STATE => state.to_string(),
        )
        .increment(1);
    }

    /// Records a dispatch decision.
    pub fn record_dispatch(&self, outcome: &str, dispatcher: &str) {
        counter!(
            names::DISPATCHES_TOTAL,
            labels::OUTCOME => outcome.to_string(),
            labels::DISPATCHER => dispatcher.to_string(),
        )
        .increment(1);
    }

    /// Sets the dispatch queue depth.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_queue_depth(&self, depth: usize) {
        gauge!(names::DISPATCH_QUEUE_DEPTH).set(depth as f64);
    }

    /// Records a task run duration with its outcome.
    pub fn observe_task_duration(&self, outcome: &str, duration: Duration) {
        histogram!(
            names::TASK_DURATION_SECONDS,
            labels::OUTCOME => outcome.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records a lease expiry sweep pass.
    pub fn record_lease_sweep(&self, fired: bool) {
        let result = if fired { "fired" } else { "idle" };
        counter!(
            names::LEASE_SWEEPS_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a submission requeued for retry.
    pub fn record_retry(&self, reason: &str) {
        counter!(
            names::RETRIES_TOTAL,
            labels::REASON => reason.to_string(),
        )
        .increment(1);
    }
}

/// RAII guard for timing operations.
///
/// Calls `on_drop` with the elapsed duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a guard that records elapsed time on drop.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard for a task run.
///
/// The callback receives the duration and should record it with the
/// run's final outcome label.
#[must_use]
pub fn time_task_run<F>(on_complete: F) -> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    TimingGuard::new(on_complete)
}
