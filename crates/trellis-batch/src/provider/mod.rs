//! Provider adapters.
//!
//! Both providers are modeled behind one capability interface -
//! [`BatchAdapter`] - with provider-tagged implementations selected by model
//! identifier, so the state machine never branches on a provider name.
//!
//! - [`direct`]: a provider with its own file-upload API; payloads are
//!   uploaded directly and results downloaded by file id
//! - [`object_store`]: a provider mediated through object storage; payloads
//!   are staged as objects and results appear under an output prefix
//! - [`memory`]: in-memory provider fakes for testing

pub mod direct;
pub mod memory;
pub mod object_store;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use trellis_core::id::{BatchId, TenantId};

use crate::error::{Error, Result};
use crate::record::BatchRecord;
use crate::request::{InferenceRequest, ModelId};

/// Which provider serves a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Direct-upload provider: payloads go through the provider's own file
    /// API.
    DirectUpload,
    /// Object-storage-mediated provider: payloads and results move through a
    /// storage bucket.
    ObjectStoreMediated,
}

impl ProviderKind {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::DirectUpload => "direct-upload",
            Self::ObjectStoreMediated => "object-store-mediated",
        }
    }
}

/// What a successful submission produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubmission {
    /// Provider-side job identifier.
    pub provider_batch_id: String,
    /// Where the staged request payload lives.
    pub input_location: String,
    /// Where results will land, when the provider can say at submission
    /// time.
    pub output_location: Option<String>,
}

/// Provider-side job state, normalized across providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderJobState {
    /// Accepted, not yet running.
    Pending,
    /// Actively processing.
    Running,
    /// Finished; results are available.
    Succeeded,
    /// Finished unsuccessfully.
    Failed {
        /// Provider-reported reason.
        reason: String,
    },
}

impl ProviderJobState {
    /// Returns true if the provider will not change this state again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// A provider-side job as seen by a listing call, used for orphan backfill.
#[derive(Debug, Clone)]
pub struct RemoteJob {
    /// Provider-side job identifier.
    pub provider_batch_id: String,
    /// Normalized job state.
    pub state: ProviderJobState,
    /// Model the job targets, when the provider reports it.
    pub model: Option<ModelId>,
    /// When the provider created the job.
    pub created_at: DateTime<Utc>,
    /// Staged input location, when known.
    pub input_location: Option<String>,
    /// Output location, when known.
    pub output_location: Option<String>,
}

/// The single capability interface the batch state machine drives providers
/// through.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from multiple
/// job handlers.
#[async_trait]
pub trait BatchAdapter: Send + Sync {
    /// The provider this adapter talks to.
    fn provider(&self) -> ProviderKind;

    /// Translates, stages, and creates a provider-side batch job.
    ///
    /// The three steps run in order and fail distinguishably: translation
    /// errors are [`Error::Translation`], staging and job-creation failures
    /// are provider errors. A retried submission re-stages the payload rather
    /// than reusing a previously staged one.
    ///
    /// `batch_id` is embedded in provider-side artifact paths so that
    /// location-based reconciliation is unambiguous per batch.
    async fn submit(
        &self,
        batch_id: BatchId,
        tenant: &TenantId,
        requests: &[InferenceRequest],
    ) -> Result<ProviderSubmission>;

    /// Reads the provider-side job state. Pure read; no state transition.
    ///
    /// A provider "not found" response surfaces as [`Error::JobNotFound`]
    /// (permanent), distinct from transient connectivity errors.
    async fn check_status(&self, provider_batch_id: &str) -> Result<ProviderJobState>;

    /// Fetches all result fragments for a completed batch, concatenated in
    /// correlation-id order where the provider supplies one.
    async fn download(&self, batch: &BatchRecord) -> Result<Vec<Value>>;

    /// Deletes the provider-side input and output artifacts to bound storage
    /// cost. Idempotent: already-deleted artifacts are not an error.
    async fn cleanup(&self, batch: &BatchRecord) -> Result<()>;

    /// Lists provider-side jobs created after `since`, for backfilling
    /// records orphaned by a crash between job creation and persistence.
    async fn list_jobs_since(&self, since: DateTime<Utc>) -> Result<Vec<RemoteJob>>;
}

/// Model-prefix routing table: which provider serves which models.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRouting {
    routes: Vec<(String, ProviderKind)>,
}

impl Default for ProviderRouting {
    fn default() -> Self {
        Self {
            routes: vec![
                ("gpt-".to_string(), ProviderKind::DirectUpload),
                ("o4-".to_string(), ProviderKind::DirectUpload),
                ("gemini-".to_string(), ProviderKind::ObjectStoreMediated),
            ],
        }
    }
}

impl ProviderRouting {
    /// Creates an empty routing table.
    #[must_use]
    pub const fn empty() -> Self {
        Self { routes: Vec::new() }
    }

    /// Adds a model-prefix route.
    #[must_use]
    pub fn with_route(mut self, prefix: impl Into<String>, provider: ProviderKind) -> Self {
        self.routes.push((prefix.into(), provider));
        self
    }

    /// Resolves the provider for a model identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSubmission`] if no route matches.
    pub fn resolve(&self, model: &ModelId) -> Result<ProviderKind> {
        self.routes
            .iter()
            .find(|(prefix, _)| model.as_str().starts_with(prefix.as_str()))
            .map(|(_, provider)| *provider)
            .ok_or_else(|| {
                Error::invalid_submission(format!("no provider serves model {model}"))
            })
    }
}

/// Registry of provider adapters plus the model routing table.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn BatchAdapter>>,
    routing: ProviderRouting,
}

impl AdapterRegistry {
    /// Creates a registry with the given routing table and no adapters.
    #[must_use]
    pub fn new(routing: ProviderRouting) -> Self {
        Self {
            adapters: HashMap::new(),
            routing,
        }
    }

    /// Registers an adapter under its provider kind.
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn BatchAdapter>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    /// Resolves the provider kind for a model identifier.
    pub fn route_model(&self, model: &ModelId) -> Result<ProviderKind> {
        self.routing.resolve(model)
    }

    /// Returns the adapter for a provider kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSubmission`] if no adapter is registered.
    pub fn for_provider(&self, provider: ProviderKind) -> Result<Arc<dyn BatchAdapter>> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| {
                Error::invalid_submission(format!(
                    "no adapter registered for provider {}",
                    provider.as_label()
                ))
            })
    }

    /// Provider kinds with a registered adapter.
    #[must_use]
    pub fn providers(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.adapters.keys().copied().collect();
        kinds.sort_by_key(ProviderKind::as_label);
        kinds
    }
}

/// Parses a JSONL result payload into raw result objects.
pub(crate) fn parse_jsonl(content: &bytes::Bytes) -> Result<Vec<Value>> {
    let text = std::str::from_utf8(content)
        .map_err(|_| Error::permanent("result payload is not valid UTF-8"))?;
    let mut results = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .map_err(|err| Error::permanent(format!("malformed result line: {err}")))?;
        results.push(value);
    }
    Ok(results)
}

/// Classifies a transport-level HTTP failure. Send errors are connectivity
/// conditions and retryable.
pub(crate) fn http_request_error(context: &str, err: reqwest::Error) -> Error {
    Error::transient_with_source(format!("{context}: request failed"), err)
}

/// Classifies a non-success HTTP status.
pub(crate) fn http_status_error(
    context: &str,
    status: reqwest::StatusCode,
    subject: &str,
) -> Error {
    if status == reqwest::StatusCode::NOT_FOUND {
        Error::job_not_found(subject)
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::transient(format!("{context}: provider returned {status}"))
    } else {
        Error::permanent(format!("{context}: provider returned {status}"))
    }
}

/// Orders raw result objects by their `customId` field when every object
/// carries one; otherwise leaves provider order untouched.
pub(crate) fn sort_by_correlation_id(mut results: Vec<Value>) -> Vec<Value> {
    let all_tagged = results
        .iter()
        .all(|v| v.get("customId").and_then(Value::as_str).is_some());
    if all_tagged {
        results.sort_by(|a, b| {
            let a = a.get("customId").and_then(Value::as_str).unwrap_or_default();
            let b = b.get("customId").and_then(Value::as_str).unwrap_or_default();
            a.cmp(b)
        });
    }
    results
}
