//! Object storage abstraction for bulk batch artifacts.
//!
//! The storage-mediated provider exchanges data through an object store:
//! staged request payloads go in, result fragments come out. This module
//! defines the narrow contract that mediation requires and an in-memory
//! backend for tests.
//!
//! ## Multi-Backend Compatibility
//!
//! Paths are plain `/`-separated keys so the trait maps directly onto GCS,
//! S3, or a local filesystem without leaking backend assumptions.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification timestamp.
    pub last_modified: DateTime<Utc>,
}

/// Object storage contract for batch payloads and result fragments.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from multiple
/// job handlers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes an object, replacing any existing object at the path.
    async fn put(&self, path: &str, data: Bytes) -> Result<()>;

    /// Reads an entire object.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Lists objects under the given prefix, ordered by path.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Deletes an object. Succeeds even if the object doesn't exist
    /// (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("object store lock poisoned")
}

/// In-memory object store for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
}

impl MemoryObjectStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.objects.read().map_err(poison_err)?.len())
    }

    /// Returns true if the store holds no objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let mut objects = self.objects.write().map_err(poison_err)?;
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                last_modified: Utc::now(),
            },
        );
        drop(objects);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(poison_err)?;
        let data = objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::not_found("object", path))?;
        drop(objects);
        Ok(data)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(poison_err)?;
        let metas = objects
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, stored)| ObjectMeta {
                path: path.clone(),
                size: stored.data.len() as u64,
                last_modified: stored.last_modified,
            })
            .collect();
        drop(objects);
        Ok(metas)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut objects = self.objects.write().map_err(poison_err)?;
        objects.remove(path);
        drop(objects);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() -> Result<()> {
        let store = MemoryObjectStore::new();
        store.put("a/b.jsonl", Bytes::from_static(b"line")).await?;
        let data = store.get("a/b.jsonl").await?;
        assert_eq!(data, Bytes::from_static(b"line"));
        Ok(())
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryObjectStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_by_prefix_is_ordered() -> Result<()> {
        let store = MemoryObjectStore::new();
        store.put("out/2.jsonl", Bytes::from_static(b"b")).await?;
        store.put("out/1.jsonl", Bytes::from_static(b"a")).await?;
        store.put("other/x", Bytes::from_static(b"c")).await?;

        let metas = store.list("out/").await?;
        let paths: Vec<&str> = metas.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["out/1.jsonl", "out/2.jsonl"]);
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> Result<()> {
        let store = MemoryObjectStore::new();
        store.put("x", Bytes::from_static(b"d")).await?;
        store.delete("x").await?;
        store.delete("x").await?;
        assert!(store.is_empty()?);
        Ok(())
    }
}
