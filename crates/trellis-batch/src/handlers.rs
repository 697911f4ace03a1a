//! Job handlers closing the dispatch loop.
//!
//! The change dispatcher turns document changes into queued jobs; these
//! handlers are their consumers:
//!
//! - [`NotificationJobHandler`]: runs the reconciler for each notification
//!   document the dispatcher observes
//! - [`BatchPollHandler`]: a recurring sweep that polls open batches,
//!   downloads completed ones, fails dead ones, and backfills orphaned
//!   provider jobs - the safety net for lost push notifications
//!
//! Handlers are invoked at-least-once and lean entirely on the conditional
//! writes underneath for idempotence.

use std::sync::Arc;

use async_trait::async_trait;

use trellis_core::document::{Condition, OperationSet};
use trellis_dispatch::queue::runner::{JobHandler, JobRunner};
use trellis_dispatch::queue::JobPayload;
use trellis_dispatch::rule::ListenerRule;

use crate::error::Error;
use crate::lifecycle::BatchLifecycle;
use crate::provider::ProviderJobState;
use crate::reconciler::NotificationReconciler;
use crate::record::{BatchRecord, NotificationRecord};
use crate::store::{NOTIFICATIONS_COLLECTION, NotificationStore};

/// Job name for notification reconciliation.
pub const NOTIFICATION_JOB: &str = "process-provider-notification";

/// Job name for the recurring open-batch sweep.
pub const POLL_JOB: &str = "poll-open-batches";

/// Maps a batch error into the handler failure the queue retries on.
fn handler_err(job_name: &str, err: &Error) -> trellis_dispatch::Error {
    trellis_dispatch::Error::handler(job_name, err.to_string())
}

/// Handler for `process-provider-notification` jobs.
pub struct NotificationJobHandler {
    reconciler: NotificationReconciler,
    notifications: NotificationStore,
}

impl NotificationJobHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(reconciler: NotificationReconciler, notifications: NotificationStore) -> Self {
        Self {
            reconciler,
            notifications,
        }
    }
}

#[async_trait]
impl JobHandler for NotificationJobHandler {
    async fn run(&self, payload: &JobPayload) -> trellis_dispatch::Result<()> {
        // The dispatched change event usually carries the post-image; fall
        // back to a fresh read when it doesn't.
        let record: NotificationRecord = match &payload.document {
            Some(doc) => doc.decode().map_err(trellis_dispatch::Error::Core)?,
            None => {
                let id = payload
                    .document_id
                    .parse()
                    .map_err(trellis_dispatch::Error::Core)?;
                match self
                    .notifications
                    .get(id)
                    .await
                    .map_err(|err| handler_err(NOTIFICATION_JOB, &err))?
                {
                    Some(record) => record,
                    // Deleted since dispatch; nothing left to reconcile.
                    None => return Ok(()),
                }
            }
        };

        self.reconciler
            .reconcile(&record)
            .await
            .map_err(|err| handler_err(NOTIFICATION_JOB, &err))?;
        Ok(())
    }
}

/// Handler for the recurring `poll-open-batches` sweep.
///
/// One sweep per invocation: every tenant, every provider with a registered
/// adapter. Per-batch errors are logged and left for the next sweep so one
/// stuck batch cannot stall the rest.
pub struct BatchPollHandler {
    lifecycle: BatchLifecycle,
}

impl BatchPollHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(lifecycle: BatchLifecycle) -> Self {
        Self { lifecycle }
    }

    async fn poll_one(&self, batch: &BatchRecord) {
        match self.lifecycle.check_status(batch).await {
            Ok(ProviderJobState::Succeeded) => {
                if let Err(err) = self.lifecycle.download_and_store(batch).await {
                    tracing::warn!(batch = %batch.id, error = %err, "result download failed");
                }
            }
            Ok(ProviderJobState::Failed { reason }) => {
                if let Err(err) = self.lifecycle.fail(batch, &reason).await {
                    tracing::warn!(batch = %batch.id, error = %err, "failed to record batch failure");
                }
            }
            // Still in flight.
            Ok(ProviderJobState::Pending | ProviderJobState::Running) => {}
            Err(Error::JobNotFound { .. }) => {
                if let Err(err) = self.lifecycle.fail(batch, "provider job not found").await {
                    tracing::warn!(batch = %batch.id, error = %err, "failed to record batch failure");
                }
            }
            Err(err) if err.is_transient() => {
                tracing::debug!(batch = %batch.id, error = %err, "status check deferred to next sweep");
            }
            Err(err) => {
                if let Err(fail_err) = self.lifecycle.fail(batch, &err.to_string()).await {
                    tracing::warn!(batch = %batch.id, error = %fail_err, "failed to record batch failure");
                }
            }
        }
    }
}

#[async_trait]
impl JobHandler for BatchPollHandler {
    async fn run(&self, _payload: &JobPayload) -> trellis_dispatch::Result<()> {
        let stores = self.lifecycle.stores();
        let tenants = stores
            .tenants()
            .await
            .map_err(|err| handler_err(POLL_JOB, &err))?;

        for tenant in tenants {
            for provider in self.lifecycle.adapters().providers() {
                if let Err(err) = self.lifecycle.reconcile_orphans(&tenant, provider).await {
                    tracing::warn!(tenant = %tenant, error = %err, "orphan sweep failed");
                }

                let store = stores
                    .for_tenant(&tenant)
                    .await
                    .map_err(|err| handler_err(POLL_JOB, &err))?;
                let open = store
                    .open_batches(provider)
                    .await
                    .map_err(|err| handler_err(POLL_JOB, &err))?;
                for batch in open {
                    self.poll_one(&batch).await;
                }
            }
        }
        Ok(())
    }
}

/// The minimal rule set the dispatcher seeds at startup: new (or corrected)
/// notification documents trigger reconciliation jobs.
#[must_use]
pub fn default_rule_seeds() -> Vec<ListenerRule> {
    vec![
        ListenerRule::new(
            "provider-notification-created",
            NOTIFICATIONS_COLLECTION,
            NOTIFICATION_JOB,
        )
        .with_operations(OperationSet::WRITES)
        .with_predicate(Condition::equals("processed", false)),
    ]
}

/// Registers both handlers on a job runner.
pub fn register_handlers(
    runner: &mut JobRunner,
    lifecycle: &BatchLifecycle,
    reconciler: &NotificationReconciler,
    notifications: &NotificationStore,
) {
    runner.register(
        NOTIFICATION_JOB,
        Arc::new(NotificationJobHandler::new(
            reconciler.clone(),
            notifications.clone(),
        )),
    );
    runner.register(POLL_JOB, Arc::new(BatchPollHandler::new(lifecycle.clone())));
}
