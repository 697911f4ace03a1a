//! The batch state machine.
//!
//! Drives a [`BatchRecord`] through its lifecycle using a provider adapter:
//!
//! 1. `submit` translates, stages, and creates the provider job, then
//!    persists the record - in that order, so a crash between job creation
//!    and persistence leaves an orphaned provider job that
//!    [`BatchLifecycle::reconcile_orphans`] backfills from a provider listing
//! 2. `download_and_store` fetches results and advances
//!    `submitted -> received` behind a compare-and-set, so re-invocation and
//!    racing instances collapse to one stored result set
//! 3. `fail` moves any non-terminal batch to `failed` with a recorded reason
//!
//! Persistence failures after provider acceptance are retried until they
//! succeed: the provider-side cost is already incurred, and abandoning the
//! write would orphan a paid job.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use trellis_core::Backoff;
use trellis_core::document::{CasOutcome, FieldUpdate};
use trellis_core::id::{BatchId, TenantId};

use crate::error::{Error, Result};
use crate::metrics::BatchMetrics;
use crate::provider::{AdapterRegistry, ProviderJobState, ProviderKind, RemoteJob};
use crate::record::{BatchRecord, BatchStatus};
use crate::request::{InferenceRequest, ModelId};
use crate::store::BatchStores;

/// Configuration for the batch state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleConfig {
    /// Attempt budget for persisting a provider-accepted record. `None`
    /// retries indefinitely, which is the correct production posture; tests
    /// bound it.
    #[serde(default)]
    pub persist_attempts: Option<u32>,
    /// Base delay between persistence retries.
    #[serde(default = "default_persist_backoff_base")]
    pub persist_backoff_base: Duration,
    /// Cap for persistence retry delay.
    #[serde(default = "default_persist_backoff_cap")]
    pub persist_backoff_cap: Duration,
    /// How far back to list provider jobs when a partition has no local
    /// records to anchor the orphan sweep.
    #[serde(default = "default_orphan_lookback")]
    pub orphan_lookback: Duration,
}

fn default_persist_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_persist_backoff_cap() -> Duration {
    Duration::from_secs(30)
}

fn default_orphan_lookback() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            persist_attempts: None,
            persist_backoff_base: default_persist_backoff_base(),
            persist_backoff_cap: default_persist_backoff_cap(),
            orphan_lookback: default_orphan_lookback(),
        }
    }
}

/// What a successful submission handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// The new batch record's id.
    pub batch_id: BatchId,
    /// The provider-side job identifier.
    pub provider_batch_id: String,
    /// Number of requests submitted.
    pub request_count: u32,
}

/// Result of a download-and-store invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Results were downloaded and stored by this invocation.
    Stored {
        /// Number of result objects stored.
        count: usize,
    },
    /// The record had already advanced; nothing was downloaded.
    AlreadyReceived,
}

/// The batch state machine.
///
/// Cheap to clone; clones share adapters and store handles.
#[derive(Clone)]
pub struct BatchLifecycle {
    adapters: AdapterRegistry,
    stores: BatchStores,
    config: LifecycleConfig,
    metrics: BatchMetrics,
}

impl BatchLifecycle {
    /// Creates the state machine.
    #[must_use]
    pub fn new(adapters: AdapterRegistry, stores: BatchStores, config: LifecycleConfig) -> Self {
        Self {
            adapters,
            stores,
            config,
            metrics: BatchMetrics::new(),
        }
    }

    /// The adapter registry this lifecycle drives providers through.
    #[must_use]
    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// The per-tenant batch store opener.
    #[must_use]
    pub fn stores(&self) -> &BatchStores {
        &self.stores
    }

    /// Submits a group of inference requests as one provider batch.
    ///
    /// The record is persisted with status `submitted` only after the
    /// provider accepts the job.
    pub async fn submit(
        &self,
        requests: &[InferenceRequest],
        tenant: &TenantId,
    ) -> Result<SubmitReceipt> {
        let provider = self.validate(requests)?;
        let adapter = self.adapters.for_provider(provider)?;

        let batch_id = BatchId::generate();
        let submission = adapter.submit(batch_id, tenant, requests).await?;

        let record = BatchRecord::submitted(
            batch_id,
            tenant.clone(),
            provider,
            requests[0].model.clone(),
            &submission,
            u32::try_from(requests.len()).unwrap_or(u32::MAX),
        );
        self.persist_accepted(tenant, &record).await?;
        self.metrics.record_submission(provider);
        tracing::info!(
            batch = %batch_id,
            tenant = %tenant,
            provider = provider.as_label(),
            requests = record.request_count,
            "batch submitted"
        );

        Ok(SubmitReceipt {
            batch_id,
            provider_batch_id: record.provider_batch_id,
            request_count: record.request_count,
        })
    }

    /// Reads the provider-side job state for a batch. Pure read.
    pub async fn check_status(&self, batch: &BatchRecord) -> Result<ProviderJobState> {
        let adapter = self.adapters.for_provider(batch.provider)?;
        adapter.check_status(&batch.provider_batch_id).await
    }

    /// Downloads results, stores them on the record, and advances the batch
    /// to `received`.
    ///
    /// Safe under re-invocation: the forward transition applies only while
    /// the record is still `submitted`, so a repeated call against an
    /// already-received record is a no-op beyond re-confirming cleanup.
    pub async fn download_and_store(&self, batch: &BatchRecord) -> Result<DownloadOutcome> {
        let adapter = self.adapters.for_provider(batch.provider)?;
        let store = self.stores.for_tenant(&batch.tenant_id).await?;

        let current = store
            .get(batch.id)
            .await?
            .ok_or_else(|| trellis_core::Error::not_found("batch", batch.id))
            .map_err(Error::Core)?;
        if current.status != BatchStatus::Submitted {
            if let Err(err) = adapter.cleanup(&current).await {
                tracing::warn!(batch = %batch.id, error = %err, "artifact cleanup re-check failed");
            }
            return Ok(DownloadOutcome::AlreadyReceived);
        }

        let started = Instant::now();
        let results = adapter.download(&current).await?;
        let count = results.len();
        let updates = vec![
            // Full replacement, never an append.
            FieldUpdate::Set("results".to_string(), Value::Array(results)),
            FieldUpdate::Set(
                "completedAt".to_string(),
                serde_json::to_value(Utc::now()).unwrap_or(Value::Null),
            ),
        ];
        match store
            .transition(batch.id, BatchStatus::Submitted, BatchStatus::Received, updates)
            .await?
        {
            CasOutcome::Applied => {
                self.metrics
                    .record_transition(BatchStatus::Submitted, BatchStatus::Received);
                self.metrics
                    .observe_download_duration(batch.provider, started.elapsed());
                if let Err(err) = adapter.cleanup(&current).await {
                    // Results are durable; the next poll sweep retries the
                    // artifacts.
                    tracing::warn!(batch = %batch.id, error = %err, "artifact cleanup failed");
                }
                tracing::info!(batch = %batch.id, results = count, "results stored");
                Ok(DownloadOutcome::Stored { count })
            }
            // A racing instance won the transition; its download stands.
            CasOutcome::PreconditionFailed => Ok(DownloadOutcome::AlreadyReceived),
            CasOutcome::NotFound => {
                Err(Error::Core(trellis_core::Error::not_found("batch", batch.id)))
            }
        }
    }

    /// Moves a batch to `failed` with a recorded reason. A no-op on batches
    /// already terminal.
    pub async fn fail(&self, batch: &BatchRecord, reason: &str) -> Result<CasOutcome> {
        let store = self.stores.for_tenant(&batch.tenant_id).await?;
        let current = store
            .get(batch.id)
            .await?
            .ok_or_else(|| trellis_core::Error::not_found("batch", batch.id))
            .map_err(Error::Core)?;
        if current.status.is_terminal() {
            return Ok(CasOutcome::PreconditionFailed);
        }

        let updates = vec![
            FieldUpdate::set("failureReason", reason),
            FieldUpdate::Set(
                "completedAt".to_string(),
                serde_json::to_value(Utc::now()).unwrap_or(Value::Null),
            ),
        ];
        let outcome = store
            .transition(batch.id, current.status, BatchStatus::Failed, updates)
            .await?;
        if outcome.is_applied() {
            self.metrics
                .record_transition(current.status, BatchStatus::Failed);
            tracing::warn!(batch = %batch.id, reason, "batch failed");
        }
        Ok(outcome)
    }

    /// Backfills records for provider jobs newer than the last known local
    /// submission that have no local record - the recovery pass for a crash
    /// between provider acceptance and persistence.
    ///
    /// Returns the number of records backfilled.
    pub async fn reconcile_orphans(
        &self,
        tenant: &TenantId,
        provider: ProviderKind,
    ) -> Result<usize> {
        let adapter = self.adapters.for_provider(provider)?;
        let store = self.stores.for_tenant(tenant).await?;

        let since = match store.latest_submission().await? {
            Some(at) => at,
            None => {
                Utc::now()
                    - chrono::Duration::from_std(self.config.orphan_lookback)
                        .unwrap_or(chrono::Duration::hours(24))
            }
        };

        let mut backfilled = 0usize;
        for job in adapter.list_jobs_since(since).await? {
            if store
                .find_by_provider_batch_id(&job.provider_batch_id)
                .await?
                .is_some()
            {
                continue;
            }
            let record = backfill_record(tenant, provider, &job);
            store.create(&record).await?;
            tracing::info!(
                batch = %record.id,
                provider_batch = %record.provider_batch_id,
                "backfilled orphaned provider job"
            );
            backfilled += 1;
        }
        if backfilled > 0 {
            self.metrics
                .record_orphans_backfilled(provider, backfilled as u64);
        }
        Ok(backfilled)
    }

    /// Validates a submission and resolves its provider.
    fn validate(&self, requests: &[InferenceRequest]) -> Result<ProviderKind> {
        if requests.is_empty() {
            return Err(Error::invalid_submission("submission carries no requests"));
        }
        let mut seen = HashSet::new();
        for request in requests {
            if request.messages.is_empty() {
                return Err(Error::invalid_submission(format!(
                    "request {} carries no messages",
                    request.custom_id
                )));
            }
            if !seen.insert(request.custom_id.as_str()) {
                return Err(Error::invalid_submission(format!(
                    "duplicate correlation id {}",
                    request.custom_id
                )));
            }
        }
        let provider = self.adapters.route_model(&requests[0].model)?;
        for request in &requests[1..] {
            if self.adapters.route_model(&request.model)? != provider {
                return Err(Error::invalid_submission(
                    "requests mix models served by different providers",
                ));
            }
        }
        Ok(provider)
    }

    /// Persists a provider-accepted record, retrying storage failures.
    async fn persist_accepted(&self, tenant: &TenantId, record: &BatchRecord) -> Result<()> {
        let mut backoff = Backoff::new(
            self.config.persist_backoff_base,
            self.config.persist_backoff_cap,
        );
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_persist(tenant, record).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if let Some(budget) = self.config.persist_attempts {
                        if attempt >= budget {
                            return Err(Error::Persistence {
                                message: format!(
                                    "record for provider job {} not persisted after {attempt} attempts: {err}",
                                    record.provider_batch_id
                                ),
                                source: None,
                            });
                        }
                    }
                    tracing::warn!(
                        batch = %record.id,
                        provider_batch = %record.provider_batch_id,
                        attempt,
                        error = %err,
                        "record persistence failed after provider acceptance, retrying"
                    );
                    tokio::time::sleep(backoff.next()).await;
                }
            }
        }
    }

    async fn try_persist(&self, tenant: &TenantId, record: &BatchRecord) -> Result<()> {
        let store = self.stores.for_tenant(tenant).await?;
        match store.create(record).await {
            Ok(()) => Ok(()),
            // A previous attempt that errored after its write actually landed.
            Err(Error::Core(trellis_core::Error::InvalidInput(_))) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Builds a `submitted` record from a provider listing entry.
///
/// The request count is unknown for backfilled jobs; the results write at
/// `received` carries the authoritative count.
fn backfill_record(tenant: &TenantId, provider: ProviderKind, job: &RemoteJob) -> BatchRecord {
    BatchRecord {
        id: BatchId::generate(),
        tenant_id: tenant.clone(),
        provider_batch_id: job.provider_batch_id.clone(),
        provider,
        model: job.model.clone().unwrap_or_else(|| ModelId::new("unknown")),
        status: BatchStatus::Submitted,
        request_count: 0,
        input_location: job.input_location.clone().unwrap_or_default(),
        output_location: job.output_location.clone(),
        submitted_at: job.created_at,
        completed_at: None,
        results: Vec::new(),
        is_processed: false,
        failure_reason: None,
    }
}
