//! In-memory document store implementation for testing.
//!
//! This module provides [`MemoryDocumentStore`], an in-process implementation
//! of the full [`DocumentStore`] contract, including conditional updates and
//! resumable change subscriptions.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no persistence, no distribution
//! - **Single-process only**: changes are not visible across process
//!   boundaries
//! - **Unbounded change log**: every change is retained so any resume token
//!   stays valid for the life of the process

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{
    CasOutcome, ChangeEvent, ChangeSubscription, Condition, Document, DocumentStore, FieldUpdate,
    OperationType, ResumeToken, WatchSpec, set_path, unset_path,
};
use crate::error::{Error, Result};

/// Capacity of the per-collection live change broadcast.
const BROADCAST_CAPACITY: usize = 1024;

/// Capacity of each subscription's delivery channel.
const SUBSCRIPTION_CAPACITY: usize = 256;

/// A change retained in a collection's log.
#[derive(Debug, Clone)]
struct LoggedChange {
    seq: u64,
    operation: OperationType,
    document_id: String,
    document: Option<Document>,
}

impl LoggedChange {
    fn to_event(&self) -> ChangeEvent {
        ChangeEvent {
            operation: self.operation,
            document_id: self.document_id.clone(),
            document: self.document.clone(),
            resume_token: sequence_token(self.seq),
        }
    }

    fn passes(&self, spec: &WatchSpec) -> bool {
        if !spec.operations.contains(self.operation) {
            return false;
        }
        // The filter applies to the post-image; deletes carry none and pass
        // the operation filter alone.
        match &self.document {
            Some(doc) => spec.filter.matches(&doc.body),
            None => true,
        }
    }
}

/// State of one collection.
struct CollectionState {
    documents: HashMap<String, Document>,
    log: Vec<LoggedChange>,
    live: broadcast::Sender<LoggedChange>,
}

impl CollectionState {
    fn new() -> Self {
        let (live, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            documents: HashMap::new(),
            log: Vec::new(),
            live,
        }
    }
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<String, CollectionState>,
    next_seq: u64,
}

impl StoreState {
    fn collection(&mut self, name: &str) -> &mut CollectionState {
        self.collections
            .entry(name.to_string())
            .or_insert_with(CollectionState::new)
    }

    /// Appends a change to the collection log and fans it out to live
    /// subscribers. Must be called with the state lock held so sequence
    /// assignment and fan-out are atomic with the mutation.
    fn record(
        &mut self,
        collection: &str,
        operation: OperationType,
        document_id: String,
        document: Option<Document>,
    ) {
        self.next_seq += 1;
        let change = LoggedChange {
            seq: self.next_seq,
            operation,
            document_id,
            document,
        };
        let state = self.collection(collection);
        state.log.push(change.clone());
        // No receivers is fine.
        let _ = state.live.send(change);
    }
}

/// Formats a sequence number as an opaque resume token.
fn sequence_token(seq: u64) -> ResumeToken {
    ResumeToken::new(format!("{seq:020}"))
}

/// Parses a resume token back into a sequence number.
fn token_sequence(token: &ResumeToken) -> Result<u64> {
    token
        .as_str()
        .parse::<u64>()
        .map_err(|_| Error::InvalidInput(format!("malformed resume token: {token}")))
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("document store lock poisoned")
}

/// In-memory document store for testing.
///
/// Implements the whole [`DocumentStore`] contract: conditional updates are
/// atomic under an internal lock, and change subscriptions replay from any
/// previously observed resume token before following live changes.
///
/// ## Example
///
/// ```rust
/// use trellis_core::MemoryDocumentStore;
///
/// let store = MemoryDocumentStore::new();
/// // Use store in tests...
/// ```
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryDocumentStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let state = self.state.read().map_err(poison_err)?;
        let doc = state
            .collections
            .get(collection)
            .and_then(|c| c.documents.get(id))
            .cloned();
        drop(state);
        Ok(doc)
    }

    async fn insert(&self, collection: &str, doc: Document) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.collection(collection).documents.contains_key(&doc.id) {
            return Err(Error::InvalidInput(format!(
                "document {} already exists in {collection}",
                doc.id
            )));
        }
        state
            .collection(collection)
            .documents
            .insert(doc.id.clone(), doc.clone());
        state.record(collection, OperationType::Insert, doc.id.clone(), Some(doc));
        drop(state);
        Ok(())
    }

    async fn upsert(&self, collection: &str, doc: Document) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let existed = state
            .collection(collection)
            .documents
            .insert(doc.id.clone(), doc.clone())
            .is_some();
        let operation = if existed {
            OperationType::Update
        } else {
            OperationType::Insert
        };
        state.record(collection, operation, doc.id.clone(), Some(doc));
        drop(state);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        let existed = state.collection(collection).documents.remove(id).is_some();
        if existed {
            state.record(collection, OperationType::Delete, id.to_string(), None);
        }
        drop(state);
        Ok(existed)
    }

    async fn find(&self, collection: &str, filter: &Condition) -> Result<Vec<Document>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut docs: Vec<Document> = state
            .collections
            .get(collection)
            .map(|c| {
                c.documents
                    .values()
                    .filter(|d| filter.matches(&d.body))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(state);
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    async fn update_if(
        &self,
        collection: &str,
        id: &str,
        expected: &Condition,
        updates: &[FieldUpdate],
    ) -> Result<CasOutcome> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(doc) = state.collection(collection).documents.get_mut(id) else {
            return Ok(CasOutcome::NotFound);
        };
        if !expected.matches(&doc.body) {
            return Ok(CasOutcome::PreconditionFailed);
        }
        for update in updates {
            match update {
                FieldUpdate::Set(path, value) => set_path(&mut doc.body, path, value.clone()),
                FieldUpdate::Unset(path) => unset_path(&mut doc.body, path),
            }
        }
        let updated = doc.clone();
        state.record(
            collection,
            OperationType::Update,
            id.to_string(),
            Some(updated),
        );
        drop(state);
        Ok(CasOutcome::Applied)
    }

    async fn watch(&self, spec: WatchSpec) -> Result<ChangeSubscription> {
        let resume_seq = match &spec.resume_after {
            Some(token) => Some(token_sequence(token)?),
            None => None,
        };

        // Subscribe and snapshot under the same lock acquisition so no change
        // can fall between the replayed log and the live channel.
        let (backlog, mut live) = {
            let mut state = self.state.write().map_err(poison_err)?;
            let tail = state.next_seq;
            let start = resume_seq.unwrap_or(tail);
            let collection = state.collection(&spec.collection);
            let backlog: Vec<LoggedChange> = collection
                .log
                .iter()
                .filter(|c| c.seq > start)
                .cloned()
                .collect();
            (backlog, collection.live.subscribe())
        };

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let forwarder = tokio::spawn(async move {
            let mut last_seq = 0u64;
            for change in backlog {
                last_seq = change.seq;
                if !change.passes(&spec) {
                    continue;
                }
                if tx.send(Ok(change.to_event())).await.is_err() {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(change) => {
                        // Replayed backlog overlaps the live channel; skip
                        // anything already delivered.
                        if change.seq <= last_seq {
                            continue;
                        }
                        last_seq = change.seq;
                        if !change.passes(&spec) {
                            continue;
                        }
                        if tx.send(Ok(change.to_event())).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let _ = tx
                            .send(Err(Error::subscription_closed(format!(
                                "change stream lagged by {skipped} events"
                            ))))
                            .await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(ChangeSubscription::from_parts(rx, forwarder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::OperationSet;
    use serde_json::{Map, json};

    fn doc(id: &str, body: serde_json::Value) -> Document {
        let body = body.as_object().cloned().unwrap_or_else(Map::new);
        Document::new(id.to_string(), body)
    }

    #[tokio::test]
    async fn insert_and_get() -> Result<()> {
        let store = MemoryDocumentStore::new();
        store
            .insert("rules", doc("r-1", json!({"id": "r-1", "name": "a"})))
            .await?;

        let found = store.get("rules", "r-1").await?.expect("document exists");
        assert_eq!(found.field("name"), Some(&json!("a")));

        let missing = store.get("rules", "r-2").await?;
        assert!(missing.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() -> Result<()> {
        let store = MemoryDocumentStore::new();
        store.insert("rules", doc("r-1", json!({}))).await?;
        let err = store.insert("rules", doc("r-1", json!({}))).await;
        assert!(err.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn find_applies_filter() -> Result<()> {
        let store = MemoryDocumentStore::new();
        store
            .insert("batches", doc("b-1", json!({"status": "submitted"})))
            .await?;
        store
            .insert("batches", doc("b-2", json!({"status": "received"})))
            .await?;

        let open = store
            .find("batches", &Condition::equals("status", "submitted"))
            .await?;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "b-1");
        Ok(())
    }

    #[tokio::test]
    async fn update_if_enforces_precondition() -> Result<()> {
        let store = MemoryDocumentStore::new();
        store
            .insert("batches", doc("b-1", json!({"status": "submitted"})))
            .await?;

        let outcome = store
            .update_if(
                "batches",
                "b-1",
                &Condition::equals("status", "submitted"),
                &[FieldUpdate::set("status", "received")],
            )
            .await?;
        assert_eq!(outcome, CasOutcome::Applied);

        // Re-running the same transition fails the precondition.
        let outcome = store
            .update_if(
                "batches",
                "b-1",
                &Condition::equals("status", "submitted"),
                &[FieldUpdate::set("status", "received")],
            )
            .await?;
        assert_eq!(outcome, CasOutcome::PreconditionFailed);

        let outcome = store
            .update_if("batches", "b-9", &Condition::True, &[])
            .await?;
        assert_eq!(outcome, CasOutcome::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn racing_conditional_updates_apply_once() -> Result<()> {
        let store = MemoryDocumentStore::new();
        store
            .insert("batches", doc("b-1", json!({"status": "submitted"})))
            .await?;

        let mut applied = 0;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_if(
                        "batches",
                        "b-1",
                        &Condition::equals("status", "submitted"),
                        &[FieldUpdate::set("status", "received")],
                    )
                    .await
            }));
        }
        for handle in handles {
            if handle.await.expect("task panicked")?.is_applied() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        Ok(())
    }

    #[tokio::test]
    async fn watch_delivers_live_changes() -> Result<()> {
        let store = MemoryDocumentStore::new();
        let mut sub = store.watch(WatchSpec::new("rules")).await?;

        store
            .insert("rules", doc("r-1", json!({"id": "r-1"})))
            .await?;

        let event = sub.next().await.expect("event")?;
        assert_eq!(event.operation, OperationType::Insert);
        assert_eq!(event.document_id, "r-1");
        assert!(event.document.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn watch_resumes_after_token() -> Result<()> {
        let store = MemoryDocumentStore::new();
        let mut sub = store.watch(WatchSpec::new("rules")).await?;

        store.insert("rules", doc("r-1", json!({}))).await?;
        store.insert("rules", doc("r-2", json!({}))).await?;

        let first = sub.next().await.expect("event")?;
        sub.close();

        // A new subscription from the first token sees only the second event.
        let mut resumed = store
            .watch(WatchSpec::new("rules").resume_after(Some(first.resume_token)))
            .await?;
        let event = resumed.next().await.expect("event")?;
        assert_eq!(event.document_id, "r-2");
        Ok(())
    }

    #[tokio::test]
    async fn watch_without_token_skips_history() -> Result<()> {
        let store = MemoryDocumentStore::new();
        store.insert("rules", doc("r-1", json!({}))).await?;

        let mut sub = store.watch(WatchSpec::new("rules")).await?;
        store.insert("rules", doc("r-2", json!({}))).await?;

        let event = sub.next().await.expect("event")?;
        assert_eq!(event.document_id, "r-2");
        Ok(())
    }

    #[tokio::test]
    async fn watch_filters_operations_and_predicate() -> Result<()> {
        let store = MemoryDocumentStore::new();
        let spec = WatchSpec::new("notifications")
            .with_operations(OperationSet::INSERTS)
            .with_filter(Condition::equals("processed", false));
        let mut sub = store.watch(spec).await?;

        // Filtered out: predicate mismatch.
        store
            .insert("notifications", doc("n-1", json!({"processed": true})))
            .await?;
        // Delivered.
        store
            .insert("notifications", doc("n-2", json!({"processed": false})))
            .await?;
        // Filtered out: wrong operation type.
        store.delete("notifications", "n-2").await?;
        // Delivered.
        store
            .insert("notifications", doc("n-3", json!({"processed": false})))
            .await?;

        let event = sub.next().await.expect("event")?;
        assert_eq!(event.document_id, "n-2");
        let event = sub.next().await.expect("event")?;
        assert_eq!(event.document_id, "n-3");
        Ok(())
    }

    #[tokio::test]
    async fn malformed_resume_token_rejected() {
        let store = MemoryDocumentStore::new();
        let spec = WatchSpec::new("rules").resume_after(Some(ResumeToken::new("not-a-seq")));
        let err = store.watch(spec).await;
        assert!(err.is_err());
    }
}
