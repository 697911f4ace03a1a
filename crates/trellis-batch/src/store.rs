//! Typed access to batch and notification collections.
//!
//! Forward state transitions are single conditional updates guarded by the
//! current status. [`BatchStore::transition`] is the sole mutual-exclusion
//! point between concurrent reconciliation attempts: two instances racing to
//! advance the same batch cannot both succeed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use trellis_core::document::{CasOutcome, Condition, Document, DocumentStore, FieldUpdate};
use trellis_core::id::{BatchId, NotificationId, TenantId};
use trellis_core::tenancy::StoreProvider;

use crate::error::Result;
use crate::provider::ProviderKind;
use crate::record::{BatchRecord, BatchStatus, NotificationRecord};

/// Collection holding batch records (tenant partitions).
pub const BATCHES_COLLECTION: &str = "inference_batches";

/// Collection holding provider notifications (shared partition).
pub const NOTIFICATIONS_COLLECTION: &str = "provider_notifications";

/// Typed wrapper over one tenant partition's batch collection.
#[derive(Clone)]
pub struct BatchStore {
    store: Arc<dyn DocumentStore>,
}

impl BatchStore {
    /// Creates a batch store over a tenant partition.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Persists a freshly submitted record.
    pub async fn create(&self, record: &BatchRecord) -> Result<()> {
        self.store
            .insert(BATCHES_COLLECTION, Document::encode(record)?)
            .await?;
        Ok(())
    }

    /// Gets a batch by id.
    pub async fn get(&self, id: BatchId) -> Result<Option<BatchRecord>> {
        let doc = self.store.get(BATCHES_COLLECTION, &id.to_string()).await?;
        Ok(match doc {
            Some(doc) => Some(doc.decode()?),
            None => None,
        })
    }

    /// Returns all batches still awaiting results for a provider.
    pub async fn open_batches(&self, provider: ProviderKind) -> Result<Vec<BatchRecord>> {
        let filter = Condition::All(vec![
            Condition::equals("status", BatchStatus::Submitted.as_label()),
            Condition::Equals(
                "provider".to_string(),
                serde_json::to_value(provider).unwrap_or(Value::Null),
            ),
        ]);
        self.decode_all(self.store.find(BATCHES_COLLECTION, &filter).await?)
    }

    /// Finds a batch by its provider-side job identifier, regardless of
    /// status.
    pub async fn find_by_provider_batch_id(
        &self,
        provider_batch_id: &str,
    ) -> Result<Option<BatchRecord>> {
        let docs = self
            .store
            .find(
                BATCHES_COLLECTION,
                &Condition::equals("providerBatchId", provider_batch_id),
            )
            .await?;
        Ok(match docs.into_iter().next() {
            Some(doc) => Some(doc.decode()?),
            None => None,
        })
    }

    /// Atomically advances a batch's status.
    ///
    /// The update applies only if the record's current status equals `from`
    /// and the transition is forward along the lifecycle. Extra field updates
    /// ride along in the same atomic write.
    pub async fn transition(
        &self,
        id: BatchId,
        from: BatchStatus,
        to: BatchStatus,
        extra: Vec<FieldUpdate>,
    ) -> Result<CasOutcome> {
        debug_assert!(from.can_transition_to(to), "backward transition requested");
        let expected = Condition::equals("status", from.as_label());
        let mut updates = vec![FieldUpdate::set("status", to.as_label())];
        updates.extend(extra);
        Ok(self
            .store
            .update_if(BATCHES_COLLECTION, &id.to_string(), &expected, &updates)
            .await?)
    }

    /// The most recent local submission time, used as the lower bound when
    /// listing provider jobs for orphan backfill.
    pub async fn latest_submission(&self) -> Result<Option<DateTime<Utc>>> {
        let docs = self.store.find(BATCHES_COLLECTION, &Condition::True).await?;
        let mut latest = None;
        for doc in docs {
            let record: BatchRecord = doc.decode()?;
            if latest.is_none_or(|at| record.submitted_at > at) {
                latest = Some(record.submitted_at);
            }
        }
        Ok(latest)
    }

    fn decode_all(&self, docs: Vec<Document>) -> Result<Vec<BatchRecord>> {
        let mut records = Vec::with_capacity(docs.len());
        for doc in docs {
            records.push(doc.decode::<BatchRecord>()?);
        }
        Ok(records)
    }
}

/// Opens [`BatchStore`]s for tenant partitions.
#[derive(Clone)]
pub struct BatchStores {
    provider: Arc<dyn StoreProvider>,
}

impl BatchStores {
    /// Creates the opener over a tenant store provider.
    #[must_use]
    pub fn new(provider: Arc<dyn StoreProvider>) -> Self {
        Self { provider }
    }

    /// Opens the batch store for a tenant.
    pub async fn for_tenant(&self, tenant: &TenantId) -> Result<BatchStore> {
        Ok(BatchStore::new(self.provider.open(tenant).await?))
    }

    /// Lists the tenants whose partitions may hold batches.
    pub async fn tenants(&self) -> Result<Vec<TenantId>> {
        Ok(self.provider.tenants().await?)
    }
}

/// Typed wrapper over the shared notification collection.
#[derive(Clone)]
pub struct NotificationStore {
    store: Arc<dyn DocumentStore>,
}

impl NotificationStore {
    /// Creates a notification store over the shared partition.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Persists a notification. Normally done by the webhook-ingestion
    /// collaborator; exposed for tests and backfills.
    pub async fn create(&self, record: &NotificationRecord) -> Result<()> {
        self.store
            .insert(NOTIFICATIONS_COLLECTION, Document::encode(record)?)
            .await?;
        Ok(())
    }

    /// Gets a notification by id.
    pub async fn get(&self, id: NotificationId) -> Result<Option<NotificationRecord>> {
        let doc = self
            .store
            .get(NOTIFICATIONS_COLLECTION, &id.to_string())
            .await?;
        Ok(match doc {
            Some(doc) => Some(doc.decode()?),
            None => None,
        })
    }

    /// Atomically marks a notification processed.
    ///
    /// Applies only if `processed` is still false, so however many times the
    /// same notification is observed, exactly one observer wins.
    pub async fn mark_processed(
        &self,
        id: NotificationId,
        matched: Option<BatchId>,
    ) -> Result<CasOutcome> {
        let expected = Condition::equals("processed", false);
        let mut updates = vec![
            FieldUpdate::set("processed", true),
            FieldUpdate::Set(
                "processedAt".to_string(),
                serde_json::to_value(Utc::now()).unwrap_or(Value::Null),
            ),
        ];
        if let Some(batch_id) = matched {
            updates.push(FieldUpdate::set("matchedBatchId", batch_id.to_string()));
        }
        Ok(self
            .store
            .update_if(NOTIFICATIONS_COLLECTION, &id.to_string(), &expected, &updates)
            .await?)
    }
}
