//! Document store abstraction.
//!
//! The [`DocumentStore`] trait is the storage contract required by the
//! orchestration engine. It demands three capabilities of whatever database
//! implements it:
//!
//! - **Typed CRUD** over JSON documents grouped into named collections
//! - **Atomic conditional updates**: compare-and-set guarded by a
//!   [`Condition`] evaluated against the current document
//! - **Resumable change subscriptions**: per-collection change events with
//!   opaque [`ResumeToken`]s and server-side predicate filtering
//!
//! ## Design Principles
//!
//! - **CAS semantics**: forward-only state transitions use `update_if` so two
//!   racing instances cannot both apply a transition
//! - **At-least-once change delivery**: a subscription reopened from a resume
//!   token may replay the last observed event but never skips one
//! - **Testability**: [`memory::MemoryDocumentStore`] implements the full
//!   contract in-process

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// A JSON document stored in a collection.
///
/// The `id` mirrors the document body's `id` field and is the key used for
/// lookups and conditional updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document key within its collection.
    pub id: String,
    /// Document body as a JSON object.
    pub body: Map<String, Value>,
}

impl Document {
    /// Creates a document from an id and body.
    #[must_use]
    pub const fn new(id: String, body: Map<String, Value>) -> Self {
        Self { id, body }
    }

    /// Encodes a serializable record into a document.
    ///
    /// The record must serialize to a JSON object carrying a string `id`
    /// field; that field becomes the document key.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the record is not an object or has no
    /// string `id` field.
    pub fn encode<T: Serialize>(record: &T) -> Result<Self> {
        let value = serde_json::to_value(record)?;
        let Value::Object(body) = value else {
            return Err(Error::serialization("document body must be a JSON object"));
        };
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::serialization("document body must carry a string `id` field"))?
            .to_string();
        Ok(Self { id, body })
    }

    /// Decodes the document body into a typed record.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the body does not match the record
    /// shape.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.body.clone()))?)
    }

    /// Looks up a (possibly nested) field by dotted path.
    #[must_use]
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.body, path)
    }
}

/// The kind of change a [`ChangeEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// A document was created.
    Insert,
    /// An existing document was modified.
    Update,
    /// A document was removed.
    Delete,
}

impl OperationType {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// The set of operation types a subscription or rule is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSet {
    /// Deliver insert events.
    pub insert: bool,
    /// Deliver update events.
    pub update: bool,
    /// Deliver delete events.
    pub delete: bool,
}

impl OperationSet {
    /// All operation types.
    pub const ALL: Self = Self {
        insert: true,
        update: true,
        delete: true,
    };

    /// Inserts only.
    pub const INSERTS: Self = Self {
        insert: true,
        update: false,
        delete: false,
    };

    /// Inserts and updates.
    pub const WRITES: Self = Self {
        insert: true,
        update: true,
        delete: false,
    };

    /// Returns whether the set contains the given operation type.
    #[must_use]
    pub const fn contains(&self, op: OperationType) -> bool {
        match op {
            OperationType::Insert => self.insert,
            OperationType::Update => self.update,
            OperationType::Delete => self.delete,
        }
    }
}

/// A structured predicate over document fields.
///
/// Conditions are evaluated server-side by the store, both as change-stream
/// filters and as preconditions for [`DocumentStore::update_if`]. Paths are
/// dotted (`lock.lastHeartbeat`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Condition {
    /// Always true.
    True,
    /// The field is absent or null.
    Missing(String),
    /// The field equals the given value.
    Equals(String, Value),
    /// The field, parsed as an RFC 3339 timestamp, is strictly older than the
    /// given instant. Absent or unparseable fields do not match.
    OlderThan(String, DateTime<Utc>),
    /// All sub-conditions hold.
    All(Vec<Condition>),
    /// At least one sub-condition holds.
    Any(Vec<Condition>),
}

impl Condition {
    /// Convenience constructor for an equality check.
    #[must_use]
    pub fn equals(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals(path.into(), value.into())
    }

    /// Evaluates the condition against a document body.
    #[must_use]
    pub fn matches(&self, body: &Map<String, Value>) -> bool {
        match self {
            Self::True => true,
            Self::Missing(path) => {
                matches!(lookup_path(body, path), None | Some(Value::Null))
            }
            Self::Equals(path, expected) => lookup_path(body, path) == Some(expected),
            Self::OlderThan(path, instant) => lookup_path(body, path)
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .is_some_and(|t| t.with_timezone(&Utc) < *instant),
            Self::All(conds) => conds.iter().all(|c| c.matches(body)),
            Self::Any(conds) => conds.iter().any(|c| c.matches(body)),
        }
    }
}

/// A single field mutation applied by [`DocumentStore::update_if`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldUpdate {
    /// Sets the field at the dotted path, creating intermediate objects.
    Set(String, Value),
    /// Removes the field at the dotted path.
    Unset(String),
}

impl FieldUpdate {
    /// Convenience constructor for a set.
    #[must_use]
    pub fn set(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Set(path.into(), value.into())
    }
}

/// Result of a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The precondition held and the update was applied.
    Applied,
    /// The document does not exist.
    NotFound,
    /// The precondition did not hold; nothing was changed.
    PreconditionFailed,
}

impl CasOutcome {
    /// Returns true if the update was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Opaque cursor position within a collection's change stream.
///
/// Tokens order lexicographically in stream order but callers must treat the
/// contents as opaque.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    /// Wraps a raw token produced by a store implementation.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A change observed on a watched collection.
///
/// Ephemeral: produced by the store's change-notification mechanism and never
/// persisted by this engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// What happened to the document.
    pub operation: OperationType,
    /// Key of the affected document.
    pub document_id: String,
    /// Post-image of the document; `None` for deletes.
    pub document: Option<Document>,
    /// Cursor position of this event.
    pub resume_token: ResumeToken,
}

/// Parameters for opening a change subscription.
#[derive(Debug, Clone)]
pub struct WatchSpec {
    /// Collection to watch.
    pub collection: String,
    /// Operation types to deliver.
    pub operations: OperationSet,
    /// Server-side predicate over the post-image. Delete events carry no
    /// post-image and are filtered by operation type alone.
    pub filter: Condition,
    /// Resume position; `None` starts from the current tail.
    pub resume_after: Option<ResumeToken>,
}

impl WatchSpec {
    /// Creates a spec watching all operations on a collection from the tail.
    #[must_use]
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            operations: OperationSet::ALL,
            filter: Condition::True,
            resume_after: None,
        }
    }

    /// Restricts the operation types delivered.
    #[must_use]
    pub const fn with_operations(mut self, operations: OperationSet) -> Self {
        self.operations = operations;
        self
    }

    /// Sets the server-side filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Condition) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the resume position.
    #[must_use]
    pub fn resume_after(mut self, token: Option<ResumeToken>) -> Self {
        self.resume_after = token;
        self
    }
}

/// An open change subscription.
///
/// Events arrive in the store's native change order. A subscription that
/// falls too far behind yields [`Error::SubscriptionClosed`]; the caller
/// reopens from its last persisted resume token.
#[derive(Debug)]
pub struct ChangeSubscription {
    rx: mpsc::Receiver<Result<ChangeEvent>>,
    forwarder: JoinHandle<()>,
}

impl ChangeSubscription {
    /// Assembles a subscription from a receiver and the forwarder task that
    /// feeds it. Intended for store implementations.
    #[must_use]
    pub fn from_parts(rx: mpsc::Receiver<Result<ChangeEvent>>, forwarder: JoinHandle<()>) -> Self {
        Self { rx, forwarder }
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the subscription is closed by the store.
    pub async fn next(&mut self) -> Option<Result<ChangeEvent>> {
        self.rx.recv().await
    }

    /// Closes the subscription.
    pub fn close(self) {
        // Drop runs the abort.
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Storage abstraction over a document database.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from multiple
/// watch tasks.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Gets a document by id.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Inserts a new document.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if a document with the same id exists.
    async fn insert(&self, collection: &str, doc: Document) -> Result<()>;

    /// Inserts or fully replaces a document.
    async fn upsert(&self, collection: &str, doc: Document) -> Result<()>;

    /// Deletes a document. Returns whether it existed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// Finds all documents matching the filter.
    async fn find(&self, collection: &str, filter: &Condition) -> Result<Vec<Document>>;

    /// Atomically applies field updates if the precondition holds.
    ///
    /// The precondition is evaluated and the updates applied under the same
    /// atomicity domain; no concurrent writer can interleave. This is the
    /// compare-and-set primitive every forward-only state transition in the
    /// engine is built on.
    async fn update_if(
        &self,
        collection: &str,
        id: &str,
        expected: &Condition,
        updates: &[FieldUpdate],
    ) -> Result<CasOutcome>;

    /// Opens a change subscription.
    async fn watch(&self, spec: WatchSpec) -> Result<ChangeSubscription>;
}

/// Looks up a dotted path in a JSON object.
pub(crate) fn lookup_path<'a>(body: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = body.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Sets a dotted path in a JSON object, creating intermediate objects.
pub(crate) fn set_path(body: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = segments.pop().unwrap_or(path);
    let mut current = body;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().expect("entry was just made an object");
    }
    current.insert(leaf.to_string(), value);
}

/// Removes a dotted path from a JSON object.
pub(crate) fn unset_path(body: &mut Map<String, Value>, path: &str) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = segments.pop().unwrap_or(path);
    let mut current = body;
    for segment in segments {
        let Some(next) = current.get_mut(segment).and_then(Value::as_object_mut) else {
            return;
        };
        current = next;
    }
    current.remove(leaf);
}
