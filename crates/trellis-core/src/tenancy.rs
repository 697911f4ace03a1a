//! Per-tenant store pooling.
//!
//! Batch records live in per-tenant data partitions. Several listener rules
//! may target the same partition, so partition connections are pooled and
//! reference-counted: a partition handle is opened when the first rule needs
//! it and closed when the last holder releases it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::document::DocumentStore;
use crate::document::memory::MemoryDocumentStore;
use crate::error::{Error, Result};
use crate::id::TenantId;

/// Opens document stores for tenant partitions.
///
/// Implementations wrap whatever connection technology reaches the tenant's
/// partition; the pool layers reference counting on top.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Opens (or reuses) a store for the tenant's partition.
    async fn open(&self, tenant: &TenantId) -> Result<Arc<dyn DocumentStore>>;

    /// Lists the tenants this provider knows about.
    async fn tenants(&self) -> Result<Vec<TenantId>>;
}

struct PoolEntry {
    store: Arc<dyn DocumentStore>,
    refcount: usize,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("tenant pool lock poisoned")
}

/// Reference-counted cache of per-tenant store handles.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct TenantStorePool {
    provider: Arc<dyn StoreProvider>,
    entries: Arc<Mutex<HashMap<TenantId, PoolEntry>>>,
}

impl TenantStorePool {
    /// Creates a pool over the given provider.
    #[must_use]
    pub fn new(provider: Arc<dyn StoreProvider>) -> Self {
        Self {
            provider,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Checks out a handle for the tenant's partition, opening it on first
    /// use. The handle returns its reference on drop.
    pub async fn checkout(&self, tenant: &TenantId) -> Result<TenantStoreHandle> {
        if let Some(store) = self.try_reuse(tenant)? {
            return Ok(TenantStoreHandle {
                tenant: tenant.clone(),
                store,
                entries: Arc::clone(&self.entries),
            });
        }

        // Open outside the lock; a concurrent checkout may have opened the
        // same partition meanwhile, in which case the existing entry wins.
        let opened = self.provider.open(tenant).await?;
        let mut entries = self.entries.lock().map_err(poison_err)?;
        let entry = entries.entry(tenant.clone()).or_insert_with(|| PoolEntry {
            store: opened,
            refcount: 0,
        });
        entry.refcount += 1;
        let store = Arc::clone(&entry.store);
        drop(entries);

        Ok(TenantStoreHandle {
            tenant: tenant.clone(),
            store,
            entries: Arc::clone(&self.entries),
        })
    }

    /// Returns the number of partitions currently held open.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn active_partitions(&self) -> Result<usize> {
        Ok(self.entries.lock().map_err(poison_err)?.len())
    }

    fn try_reuse(&self, tenant: &TenantId) -> Result<Option<Arc<dyn DocumentStore>>> {
        let mut entries = self.entries.lock().map_err(poison_err)?;
        let store = entries.get_mut(tenant).map(|entry| {
            entry.refcount += 1;
            Arc::clone(&entry.store)
        });
        drop(entries);
        Ok(store)
    }
}

/// A reference-counted handle to a tenant partition's store.
///
/// Dropping the handle returns the reference; when the last handle for a
/// partition drops, the pooled connection is closed.
pub struct TenantStoreHandle {
    tenant: TenantId,
    store: Arc<dyn DocumentStore>,
    entries: Arc<Mutex<HashMap<TenantId, PoolEntry>>>,
}

impl TenantStoreHandle {
    /// The tenant this handle belongs to.
    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// The partition's document store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }
}

impl Drop for TenantStoreHandle {
    fn drop(&mut self) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if let Some(entry) = entries.get_mut(&self.tenant) {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 {
                entries.remove(&self.tenant);
                tracing::debug!(tenant = %self.tenant, "closed tenant partition");
            }
        }
    }
}

/// In-memory store provider for testing.
///
/// Partitions are created on first open so tests can point rules at any
/// tenant without pre-registration; `register` returns the concrete store so
/// tests can seed and inspect a partition directly.
#[derive(Clone, Default)]
pub struct MemoryStoreProvider {
    partitions: Arc<Mutex<HashMap<TenantId, MemoryDocumentStore>>>,
}

impl MemoryStoreProvider {
    /// Creates a provider with no partitions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or returns) the concrete partition store for a tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn register(&self, tenant: &TenantId) -> Result<MemoryDocumentStore> {
        let mut partitions = self.partitions.lock().map_err(poison_err)?;
        let store = partitions
            .entry(tenant.clone())
            .or_insert_with(MemoryDocumentStore::new)
            .clone();
        drop(partitions);
        Ok(store)
    }
}

#[async_trait]
impl StoreProvider for MemoryStoreProvider {
    async fn open(&self, tenant: &TenantId) -> Result<Arc<dyn DocumentStore>> {
        Ok(Arc::new(self.register(tenant)?))
    }

    async fn tenants(&self) -> Result<Vec<TenantId>> {
        let partitions = self.partitions.lock().map_err(poison_err)?;
        let mut tenants: Vec<TenantId> = partitions.keys().cloned().collect();
        drop(partitions);
        tenants.sort();
        Ok(tenants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).expect("valid tenant id")
    }

    #[tokio::test]
    async fn checkout_shares_partition_between_holders() -> Result<()> {
        let provider = Arc::new(MemoryStoreProvider::new());
        let pool = TenantStorePool::new(provider);

        let a = pool.checkout(&tenant("acme")).await?;
        let b = pool.checkout(&tenant("acme")).await?;
        assert_eq!(pool.active_partitions()?, 1);

        drop(a);
        assert_eq!(pool.active_partitions()?, 1);
        drop(b);
        assert_eq!(pool.active_partitions()?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn partitions_are_isolated_per_tenant() -> Result<()> {
        let provider = Arc::new(MemoryStoreProvider::new());
        let pool = TenantStorePool::new(Arc::clone(&provider) as Arc<dyn StoreProvider>);

        let a = pool.checkout(&tenant("acme")).await?;
        let b = pool.checkout(&tenant("globex")).await?;
        assert_eq!(pool.active_partitions()?, 2);

        use crate::document::{Condition, Document};
        a.store()
            .insert(
                "batches",
                Document::new("b-1".to_string(), serde_json::Map::new()),
            )
            .await?;
        let other = b.store().find("batches", &Condition::True).await?;
        assert!(other.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn provider_lists_registered_tenants() -> Result<()> {
        let provider = MemoryStoreProvider::new();
        provider.register(&tenant("globex"))?;
        provider.register(&tenant("acme"))?;
        let tenants = provider.tenants().await?;
        assert_eq!(tenants, vec![tenant("acme"), tenant("globex")]);
        Ok(())
    }
}
