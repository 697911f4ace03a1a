//! Notification reconciliation.
//!
//! Matches an inbound completion notification to a batch record and drives
//! the batch into `received`.
//!
//! ## Matching
//!
//! The direct provider's notifications carry the batch identifier, so the
//! match is exact. The storage-mediated provider's notifications carry only a
//! storage location; the match is by prefix containment against the recorded
//! output locations of still-open batches. Output locations embed the batch
//! id, so containment identifies at most one batch; the longest matching
//! location wins if several share a prefix.
//!
//! ## Idempotence
//!
//! The same notification may arrive more than once (an insert followed by a
//! corrective update, or redelivery of the triggering job). The notification's
//! `processed` flag and the batch's forward-only status transition are the
//! only sources of "already handled" truth, so re-invocation converges on the
//! same end state. An unmatched notification is still marked processed - at
//! least-once delivery must not loop on unmatchable signals - and logged, not
//! raised as an error.

use trellis_core::document::CasOutcome;
use trellis_core::id::BatchId;

use crate::error::Result;
use crate::lifecycle::BatchLifecycle;
use crate::metrics::BatchMetrics;
use crate::provider::ProviderKind;
use crate::record::{BatchRecord, NotificationRecord};
use crate::store::NotificationStore;

/// Result of reconciling one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A batch was matched and driven forward by this invocation.
    Stored {
        /// The matched batch.
        batch_id: BatchId,
    },
    /// The notification had already been handled; nothing was done.
    AlreadyProcessed,
    /// No batch matched; the notification was marked processed and dropped.
    Unmatched,
}

/// Matches notifications to batches and advances them.
#[derive(Clone)]
pub struct NotificationReconciler {
    lifecycle: BatchLifecycle,
    notifications: NotificationStore,
    metrics: BatchMetrics,
}

impl NotificationReconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(lifecycle: BatchLifecycle, notifications: NotificationStore) -> Self {
        Self {
            lifecycle,
            notifications,
            metrics: BatchMetrics::new(),
        }
    }

    /// Consumes one notification record.
    pub async fn reconcile(&self, notification: &NotificationRecord) -> Result<ReconcileOutcome> {
        if notification.processed {
            self.metrics.record_notification("already-processed");
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }

        let Some(batch) = self.locate(notification).await? else {
            // Guarantee forward progress for signals nothing matches.
            self.notifications
                .mark_processed(notification.id, None)
                .await?;
            self.metrics.record_notification("unmatched");
            tracing::info!(
                notification = %notification.id,
                provider = notification.provider.as_label(),
                key = %notification.correlating_key,
                "notification matched no batch"
            );
            return Ok(ReconcileOutcome::Unmatched);
        };

        self.lifecycle.download_and_store(&batch).await?;

        match self
            .notifications
            .mark_processed(notification.id, Some(batch.id))
            .await?
        {
            CasOutcome::Applied => {
                self.metrics.record_notification("stored");
                tracing::info!(
                    notification = %notification.id,
                    batch = %batch.id,
                    "notification reconciled"
                );
                Ok(ReconcileOutcome::Stored { batch_id: batch.id })
            }
            // A racing instance marked it first; the batch side is already
            // convergent.
            CasOutcome::PreconditionFailed | CasOutcome::NotFound => {
                self.metrics.record_notification("already-processed");
                Ok(ReconcileOutcome::AlreadyProcessed)
            }
        }
    }

    /// Locates the batch a notification refers to, if any.
    async fn locate(&self, notification: &NotificationRecord) -> Result<Option<BatchRecord>> {
        let stores = self.lifecycle.stores();
        match notification.provider {
            ProviderKind::DirectUpload => {
                for tenant in stores.tenants().await? {
                    let store = stores.for_tenant(&tenant).await?;
                    if let Some(batch) = store
                        .find_by_provider_batch_id(&notification.correlating_key)
                        .await?
                    {
                        return Ok(Some(batch));
                    }
                }
                Ok(None)
            }
            ProviderKind::ObjectStoreMediated => {
                let mut best: Option<BatchRecord> = None;
                for tenant in stores.tenants().await? {
                    let store = stores.for_tenant(&tenant).await?;
                    for batch in store.open_batches(ProviderKind::ObjectStoreMediated).await? {
                        let Some(location) = batch.output_location.as_deref() else {
                            continue;
                        };
                        if !location_matches(location, &notification.correlating_key) {
                            continue;
                        }
                        let better = best
                            .as_ref()
                            .and_then(|b| b.output_location.as_deref())
                            .is_none_or(|current| current.len() < location.len());
                        if better {
                            best = Some(batch);
                        }
                    }
                }
                Ok(best)
            }
        }
    }
}

/// Containment test between a batch's output location and a notification's
/// correlating key. Providers notify with either the exact prefix or a deeper
/// object path, so containment runs both ways.
fn location_matches(output_location: &str, correlating_key: &str) -> bool {
    correlating_key.starts_with(output_location) || output_location.starts_with(correlating_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_containment_runs_both_ways() {
        let location = "batches/acme/01ABC/out/";
        assert!(location_matches(location, "batches/acme/01ABC/out/"));
        assert!(location_matches(
            location,
            "batches/acme/01ABC/out/fragment-0001.jsonl"
        ));
        assert!(location_matches(location, "batches/acme/01ABC/"));
        assert!(!location_matches(location, "batches/acme/01XYZ/out/"));
        assert!(!location_matches(location, "elsewhere/"));
    }
}
