//! Observability metrics for the batch lifecycle.
//!
//! Prometheus-compatible metrics exposed via the `metrics` crate facade.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `trellis_batch_submissions_total` | Counter | `provider` | Batches accepted by a provider |
//! | `trellis_batch_transitions_total` | Counter | `from`, `to` | Batch status transitions applied |
//! | `trellis_batch_notifications_total` | Counter | `outcome` | Notification reconciliation outcomes |
//! | `trellis_batch_orphans_backfilled_total` | Counter | `provider` | Records backfilled from provider listings |
//! | `trellis_batch_download_duration_seconds` | Histogram | `provider` | Result download and store duration |

use std::time::Duration;

use metrics::{counter, histogram};

use crate::provider::ProviderKind;
use crate::record::BatchStatus;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: batches accepted by a provider.
    pub const SUBMISSIONS_TOTAL: &str = "trellis_batch_submissions_total";
    /// Counter: batch status transitions applied.
    pub const TRANSITIONS_TOTAL: &str = "trellis_batch_transitions_total";
    /// Counter: notification reconciliation outcomes.
    pub const NOTIFICATIONS_TOTAL: &str = "trellis_batch_notifications_total";
    /// Counter: records backfilled from provider listings.
    pub const ORPHANS_BACKFILLED_TOTAL: &str = "trellis_batch_orphans_backfilled_total";
    /// Histogram: result download and store duration in seconds.
    pub const DOWNLOAD_DURATION_SECONDS: &str = "trellis_batch_download_duration_seconds";
}

/// Metric label keys.
pub mod labels {
    /// Provider a metric belongs to.
    pub const PROVIDER: &str = "provider";
    /// Transition source status.
    pub const FROM: &str = "from";
    /// Transition target status.
    pub const TO: &str = "to";
    /// Reconciliation outcome (`stored`, `already-processed`, `unmatched`).
    pub const OUTCOME: &str = "outcome";
}

/// Metrics recorder for the batch lifecycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchMetrics;

impl BatchMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a provider-accepted submission.
    pub fn record_submission(&self, provider: ProviderKind) {
        counter!(
            names::SUBMISSIONS_TOTAL,
            labels::PROVIDER => provider.as_label(),
        )
        .increment(1);
    }

    /// Records an applied status transition.
    pub fn record_transition(&self, from: BatchStatus, to: BatchStatus) {
        counter!(
            names::TRANSITIONS_TOTAL,
            labels::FROM => from.as_label(),
            labels::TO => to.as_label(),
        )
        .increment(1);
    }

    /// Records a notification reconciliation outcome.
    pub fn record_notification(&self, outcome: &'static str) {
        counter!(
            names::NOTIFICATIONS_TOTAL,
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }

    /// Records orphaned records backfilled from a provider listing.
    pub fn record_orphans_backfilled(&self, provider: ProviderKind, count: u64) {
        counter!(
            names::ORPHANS_BACKFILLED_TOTAL,
            labels::PROVIDER => provider.as_label(),
        )
        .increment(count);
    }

    /// Records a download-and-store duration.
    pub fn observe_download_duration(&self, provider: ProviderKind, duration: Duration) {
        histogram!(
            names::DOWNLOAD_DURATION_SECONDS,
            labels::PROVIDER => provider.as_label(),
        )
        .record(duration.as_secs_f64());
    }
}
