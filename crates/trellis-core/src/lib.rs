//! # trellis-core
//!
//! Shared plumbing for the Trellis batch-inference orchestration engine.
//!
//! This crate provides:
//!
//! - **Typed identifiers**: ULID-backed ids that cannot be mixed up at
//!   compile time
//! - **Document store abstraction**: typed CRUD, atomic conditional updates,
//!   and resumable change subscriptions over a document database
//! - **Object store abstraction**: bulk artifact storage for staged batch
//!   payloads and result fragments
//! - **Tenant store pooling**: reference-counted per-tenant store handles
//! - **Backoff and observability helpers**
//!
//! ## Design Principles
//!
//! - **CAS-first correctness**: every cross-instance race is resolved by a
//!   conditional write, never by timing
//! - **Trait seams with in-memory twins**: each external dependency is a
//!   trait paired with an in-memory implementation for tests
//! - **At-least-once friendliness**: resume tokens and idempotent operations
//!   so consumers can always be re-invoked safely

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backoff;
pub mod document;
pub mod error;
pub mod id;
pub mod object_store;
pub mod observability;
pub mod tenancy;

pub use backoff::Backoff;
pub use document::memory::MemoryDocumentStore;
pub use document::{
    CasOutcome, ChangeEvent, ChangeSubscription, Condition, Document, DocumentStore, FieldUpdate,
    OperationSet, OperationType, ResumeToken, WatchSpec,
};
pub use error::{Error, Result};
pub use id::{BatchId, NotificationId, RuleId, TenantId};
pub use object_store::{MemoryObjectStore, ObjectMeta, ObjectStore};
pub use tenancy::{MemoryStoreProvider, StoreProvider, TenantStoreHandle, TenantStorePool};
