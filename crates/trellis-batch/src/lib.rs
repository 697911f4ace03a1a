//! # trellis-batch
//!
//! The batch-inference half of the Trellis orchestration engine.
//!
//! This crate implements:
//!
//! - **Inference requests**: role-tagged message content with caller-assigned
//!   correlation ids, routed to a provider by model identifier
//! - **Provider adapters**: a single capability interface over two provider
//!   shapes - a direct-upload HTTP API and an object-storage-mediated job API
//! - **Batch state machine**: forward-only lifecycle of a batch record,
//!   driven by compare-and-set status transitions
//! - **Notification reconciler**: matches out-of-band completion signals to
//!   batch records and drives them to completion, idempotently
//! - **Job handlers**: the glue that closes the loop from dispatched change
//!   events back into lifecycle progress
//!
//! ## Guarantees
//!
//! - **Monotone status**: `submitted -> received -> processed`, with `failed`
//!   reachable from any non-terminal state; no transition ever moves backward
//! - **Idempotent reconciliation**: delivering the same notification N times
//!   produces exactly one download-and-store cycle
//! - **At-least-once safety**: every handler tolerates re-invocation; all
//!   cross-instance races resolve through conditional writes

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod provider;
pub mod reconciler;
pub mod record;
pub mod request;
pub mod store;

pub use error::{Error, Result};
pub use lifecycle::{BatchLifecycle, DownloadOutcome, LifecycleConfig, SubmitReceipt};
pub use provider::{
    AdapterRegistry, BatchAdapter, ProviderJobState, ProviderKind, ProviderRouting,
    ProviderSubmission, RemoteJob,
};
pub use reconciler::{NotificationReconciler, ReconcileOutcome};
pub use record::{BatchRecord, BatchStatus, NotificationRecord};
pub use request::{InferenceRequest, Message, ModelId, Role};
pub use store::{BatchStore, BatchStores, NotificationStore};
