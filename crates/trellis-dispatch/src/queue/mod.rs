//! Job queue abstraction.
//!
//! This module provides:
//!
//! - [`JobQueue`]: trait for submitting work to a durable at-least-once queue
//! - [`JobPayload`]: serializable job submission payload
//! - [`memory::MemoryJobQueue`]: in-memory queue for testing
//! - [`runner::JobRunner`]: handler registry and execution loop
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: the same interface fits a hosted queue service or
//!   a database-backed scheduler
//! - **Idempotent dispatch**: deduplication keys derived from change-stream
//!   positions collapse re-dispatch of the same event
//! - **At-least-once delivery**: handlers signal completion or failure
//!   explicitly and must tolerate re-invocation

pub mod memory;
pub mod runner;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use trellis_core::document::{ChangeEvent, Document};
use trellis_core::id::TenantId;

use crate::error::Result;

/// Payload delivered to a job handler.
///
/// Carries the changed document (when available) so most handlers need no
/// extra read to start work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    /// Registered handler name.
    pub job_name: String,
    /// Tenant partition the triggering document lives in; `None` for the
    /// shared partition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    /// Key of the triggering document.
    pub document_id: String,
    /// Post-image of the triggering document, if the event carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
    /// When the job was submitted.
    pub enqueued_at: DateTime<Utc>,
    /// Queue deduplication key.
    dedupe_key: String,
}

impl JobPayload {
    /// Creates a payload with a unique deduplication key (never collapsed).
    #[must_use]
    pub fn new(
        job_name: impl Into<String>,
        tenant_id: Option<TenantId>,
        document_id: impl Into<String>,
        document: Option<Document>,
    ) -> Self {
        let job_name = job_name.into();
        let document_id = document_id.into();
        let dedupe_key = format!("{job_name}/{document_id}/{}", Ulid::new());
        Self {
            job_name,
            tenant_id,
            document_id,
            document,
            enqueued_at: Utc::now(),
            dedupe_key,
        }
    }

    /// Creates a payload for a change event.
    ///
    /// The deduplication key includes the event's resume token, so
    /// re-dispatching the same stream position (after a restart replays the
    /// last event) collapses to one queued job.
    #[must_use]
    pub fn from_change(
        job_name: impl Into<String>,
        tenant_id: Option<TenantId>,
        event: &ChangeEvent,
    ) -> Self {
        let job_name = job_name.into();
        let dedupe_key = format!(
            "{job_name}/{}/{}",
            event.document_id,
            event.resume_token.as_str()
        );
        Self {
            job_name,
            tenant_id,
            document_id: event.document_id.clone(),
            document: event.document.clone(),
            enqueued_at: Utc::now(),
            dedupe_key,
        }
    }

    /// Returns the queue deduplication key.
    #[must_use]
    pub fn dedupe_key(&self) -> &str {
        &self.dedupe_key
    }
}

/// Result of submitting a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The job was queued.
    Enqueued {
        /// Queue-specific message id.
        message_id: String,
    },
    /// An identical submission is already queued.
    Deduplicated {
        /// The existing message id.
        existing_message_id: String,
    },
}

impl EnqueueOutcome {
    /// Returns true if a new job was queued.
    #[must_use]
    pub const fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }

    /// Returns the message id.
    #[must_use]
    pub fn message_id(&self) -> &str {
        match self {
            Self::Enqueued { message_id }
            | Self::Deduplicated {
                existing_message_id: message_id,
            } => message_id,
        }
    }
}

/// Work queue abstraction.
///
/// Delivery is at-least-once: a handler may see the same payload more than
/// once and must be idempotent.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from multiple
/// watch tasks.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submits a job for immediate execution.
    async fn enqueue_now(&self, payload: JobPayload) -> Result<EnqueueOutcome>;

    /// Registers a recurring job fired every `interval`. Re-registering the
    /// same job name replaces the previous schedule.
    async fn schedule_recurring(&self, payload: JobPayload, interval: Duration) -> Result<()>;

    /// Cancels a recurring job. Returns whether a schedule existed.
    async fn cancel_recurring(&self, job_name: &str) -> Result<bool>;

    /// Returns the approximate number of jobs waiting for execution.
    async fn queue_depth(&self) -> Result<usize>;

    /// Returns the queue's name or identifier.
    fn queue_name(&self) -> &str;
}
