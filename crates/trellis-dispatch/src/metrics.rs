//! Observability metrics for the change dispatcher.
//!
//! Prometheus-compatible metrics exposed via the `metrics` crate facade.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `trellis_dispatch_events_total` | Counter | `rule`, `operation` | Change events dispatched to the job queue |
//! | `trellis_dispatch_jobs_enqueued_total` | Counter | `job`, `outcome` | Job submissions by enqueue outcome |
//! | `trellis_dispatch_lock_transitions_total` | Counter | `rule`, `transition` | Lock acquisitions, losses, and releases |
//! | `trellis_dispatch_subscription_errors_total` | Counter | `rule` | Subscription failures entering backoff |
//! | `trellis_dispatch_active_watches` | Gauge | - | Rule subscriptions currently open |
//! | `trellis_dispatch_event_latency_seconds` | Histogram | `rule` | Event receipt to enqueue latency |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: change events dispatched to the job queue.
    pub const EVENTS_TOTAL: &str = "trellis_dispatch_events_total";
    /// Counter: job submissions by enqueue outcome.
    pub const JOBS_ENQUEUED_TOTAL: &str = "trellis_dispatch_jobs_enqueued_total";
    /// Counter: lock acquisitions, losses, and releases.
    pub const LOCK_TRANSITIONS_TOTAL: &str = "trellis_dispatch_lock_transitions_total";
    /// Counter: subscription failures entering backoff.
    pub const SUBSCRIPTION_ERRORS_TOTAL: &str = "trellis_dispatch_subscription_errors_total";
    /// Gauge: rule subscriptions currently open.
    pub const ACTIVE_WATCHES: &str = "trellis_dispatch_active_watches";
    /// Histogram: event receipt to enqueue latency in seconds.
    pub const EVENT_LATENCY_SECONDS: &str = "trellis_dispatch_event_latency_seconds";
}

/// Metric label keys.
pub mod labels {
    /// The rule a metric belongs to.
    pub const RULE: &str = "rule";
    /// The job name of a submission.
    pub const JOB: &str = "job";
    /// The change operation type.
    pub const OPERATION: &str = "operation";
    /// Enqueue outcome (`enqueued` or `deduplicated`).
    pub const OUTCOME: &str = "outcome";
    /// Lock transition (`acquired`, `lost`, `released`, `contended`).
    pub const TRANSITION: &str = "transition";
}

/// Metrics recorder for the dispatcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a change event dispatched for a rule.
    pub fn record_event(&self, rule: &str, operation: &str) {
        counter!(
            names::EVENTS_TOTAL,
            labels::RULE => rule.to_string(),
            labels::OPERATION => operation.to_string(),
        )
        .increment(1);
    }

    /// Records a job submission outcome.
    pub fn record_enqueue(&self, job: &str, deduplicated: bool) {
        let outcome = if deduplicated { "deduplicated" } else { "enqueued" };
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            labels::JOB => job.to_string(),
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }

    /// Records a lock transition for a rule.
    pub fn record_lock_transition(&self, rule: &str, transition: &'static str) {
        counter!(
            names::LOCK_TRANSITIONS_TOTAL,
            labels::RULE => rule.to_string(),
            labels::TRANSITION => transition,
        )
        .increment(1);
    }

    /// Records a subscription failure entering backoff.
    pub fn record_subscription_error(&self, rule: &str) {
        counter!(
            names::SUBSCRIPTION_ERRORS_TOTAL,
            labels::RULE => rule.to_string(),
        )
        .increment(1);
    }

    /// Updates the open-subscription gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_active_watches(&self, count: usize) {
        gauge!(names::ACTIVE_WATCHES).set(count as f64);
    }

    /// Records event-to-enqueue latency for a rule.
    pub fn observe_event_latency(&self, rule: &str, duration: Duration) {
        histogram!(
            names::EVENT_LATENCY_SECONDS,
            labels::RULE => rule.to_string(),
        )
        .record(duration.as_secs_f64());
    }
}

/// RAII guard for timing operations.
///
/// ## Example
///
/// ```rust,no_run
/// use trellis_dispatch::metrics::{DispatchMetrics, TimingGuard};
///
/// let metrics = DispatchMetrics::new();
/// {
///     let _guard = TimingGuard::new(|duration| {
///         metrics.observe_event_latency("my-rule", duration);
///     });
///     // Do work...
/// } // Duration recorded automatically on drop
/// ```
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
    /// Creates a new timing guard that will call `on_drop` with the elapsed
    /// duration.
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
