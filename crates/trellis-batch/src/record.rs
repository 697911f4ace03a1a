//! Batch and notification record documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use trellis_core::id::{BatchId, NotificationId, TenantId};

use crate::provider::{ProviderKind, ProviderSubmission};
use crate::request::ModelId;

/// Lifecycle state of a batch record.
///
/// Transitions are monotone: `submitted -> received -> processed`, with
/// `failed` reachable from any non-terminal state. No transition ever moves
/// backward. `processed` is written only by the downstream results consumer,
/// never by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Provider accepted the job; awaiting completion.
    Submitted,
    /// Results downloaded and stored on the record.
    Received,
    /// Downstream consumer finished post-processing.
    Processed,
    /// Unrecoverable provider error; absorbing.
    Failed,
}

impl BatchStatus {
    /// Returns true if no further transition is valid from this state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed)
    }

    /// Returns whether a transition to `target` is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Submitted => matches!(target, Self::Received | Self::Failed),
            Self::Received => matches!(target, Self::Processed | Self::Failed),
            Self::Processed | Self::Failed => false,
        }
    }

    /// Returns a lowercase label suitable for documents, metrics, and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Received => "received",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

/// One submitted group of inference requests, owned by a tenant partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    /// Batch identifier (document key).
    pub id: BatchId,
    /// Owning tenant partition.
    pub tenant_id: TenantId,
    /// Provider-side job identifier.
    pub provider_batch_id: String,
    /// Provider serving the batch.
    pub provider: ProviderKind,
    /// Model the requests target.
    pub model: ModelId,
    /// Lifecycle state.
    pub status: BatchStatus,
    /// Number of requests submitted.
    pub request_count: u32,
    /// Where the staged request payload lives on the provider side.
    pub input_location: String,
    /// Where results land on the provider side. Known at submission for the
    /// storage-mediated provider; learned at completion for the direct one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_location: Option<String>,
    /// When the provider accepted the job.
    pub submitted_at: DateTime<Utc>,
    /// When results were stored (or the batch failed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Raw provider result objects, ordered by correlation id. Written
    /// exactly once, as a full replacement, on the transition into
    /// `received`.
    #[serde(default)]
    pub results: Vec<Value>,
    /// Owned by the downstream results consumer; never set by this engine.
    #[serde(default)]
    pub is_processed: bool,
    /// Reason recorded when the batch fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl BatchRecord {
    /// Creates a freshly submitted record from a provider submission.
    #[must_use]
    pub fn submitted(
        id: BatchId,
        tenant_id: TenantId,
        provider: ProviderKind,
        model: ModelId,
        submission: &ProviderSubmission,
        request_count: u32,
    ) -> Self {
        Self {
            id,
            tenant_id,
            provider_batch_id: submission.provider_batch_id.clone(),
            provider,
            model,
            status: BatchStatus::Submitted,
            request_count,
            input_location: submission.input_location.clone(),
            output_location: submission.output_location.clone(),
            submitted_at: Utc::now(),
            completed_at: None,
            results: Vec::new(),
            is_processed: false,
            failure_reason: None,
        }
    }
}

/// One completion signal received on a provider's push channel.
///
/// Created by the webhook-ingestion collaborator; this engine only consumes
/// them. `processed` moves false to true exactly once per record, however
/// many times the record is observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    /// Notification identifier (document key).
    pub id: NotificationId,
    /// Provider that sent the signal.
    pub provider: ProviderKind,
    /// Either an exact provider batch id (direct provider) or a storage
    /// location requiring prefix matching (storage-mediated provider).
    pub correlating_key: String,
    /// When the signal arrived.
    pub received_at: DateTime<Utc>,
    /// Whether reconciliation has handled this record.
    #[serde(default)]
    pub processed: bool,
    /// When reconciliation handled the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    /// The batch the record was matched to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_batch_id: Option<BatchId>,
}

impl NotificationRecord {
    /// Creates an unprocessed notification.
    #[must_use]
    pub fn new(provider: ProviderKind, correlating_key: impl Into<String>) -> Self {
        Self {
            id: NotificationId::generate(),
            provider,
            correlating_key: correlating_key.into(),
            received_at: Utc::now(),
            processed: false,
            processed_at: None,
            matched_batch_id: None,
        }
    }
}
