//! Object-storage-mediated provider adapter.
//!
//! This provider exchanges data through a storage bucket: the translated
//! payload is staged as an object, a batch job is created referencing the
//! input object and an output prefix, and result fragments appear under that
//! prefix when the job completes.
//!
//! ## Wire Translation
//!
//! This provider's format differs from the neutral request model in two ways:
//! the `assistant` role is remapped to the provider's `model` role token, and
//! system instructions are lifted out of the message list into a separate
//! `systemInstruction` field.
//!
//! ## Output Addressing
//!
//! The output prefix embeds the batch id
//! (`{root}/{tenant}/{batch_id}/out/`), so a location-carrying completion
//! notification matches exactly one batch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use trellis_core::id::{BatchId, TenantId};
use trellis_core::object_store::ObjectStore;

use super::{
    BatchAdapter, ProviderJobState, ProviderKind, ProviderSubmission, RemoteJob,
    http_request_error, http_status_error, parse_jsonl, sort_by_correlation_id,
};
use crate::error::{Error, Result};
use crate::record::BatchRecord;
use crate::request::{InferenceRequest, ModelId, Role};

/// A provider-side batch job as returned by the job API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteJobHandle {
    /// Provider-assigned job name.
    pub name: String,
    /// Provider state string (`pending`, `running`, `succeeded`, ...).
    pub state: String,
    /// Model the job targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// When the provider created the job.
    pub created_at: DateTime<Utc>,
    /// Staged input object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_uri: Option<String>,
    /// Output prefix the job writes under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_prefix: Option<String>,
    /// Provider-reported error for failed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RemoteJobHandle {
    /// Normalizes the provider state string.
    #[must_use]
    pub fn job_state(&self) -> ProviderJobState {
        match self.state.as_str() {
            "pending" | "queued" => ProviderJobState::Pending,
            "running" => ProviderJobState::Running,
            "succeeded" => ProviderJobState::Succeeded,
            other => ProviderJobState::Failed {
                reason: self
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("job ended in state {other}")),
            },
        }
    }
}

/// The storage-mediated provider's control-plane API.
///
/// Kept narrow so tests can fake it; see
/// [`super::memory::InMemoryBatchJobApi`].
#[async_trait]
pub trait BatchJobApi: Send + Sync {
    /// Creates a batch job over a staged input object.
    async fn create_job(
        &self,
        model: &ModelId,
        input_uri: &str,
        output_prefix: &str,
    ) -> Result<RemoteJobHandle>;

    /// Reads a batch job.
    async fn get_job(&self, job_name: &str) -> Result<RemoteJobHandle>;

    /// Lists batch jobs created after the given instant.
    async fn list_jobs(&self, created_after: DateTime<Utc>) -> Result<Vec<RemoteJobHandle>>;
}

/// One JSONL line of the mediated provider's batch input format.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MediatedLine {
    custom_id: String,
    request: MediatedRequest,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MediatedRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<MediatedContent>,
    contents: Vec<MediatedContent>,
}

#[derive(Serialize)]
struct MediatedContent {
    role: String,
    parts: Vec<MediatedPart>,
}

#[derive(Serialize)]
struct MediatedPart {
    text: String,
}

/// Adapter for the object-storage-mediated provider.
pub struct ObjectStoreAdapter {
    jobs: Arc<dyn BatchJobApi>,
    objects: Arc<dyn ObjectStore>,
    root: String,
}

impl ObjectStoreAdapter {
    /// Creates an adapter staging payloads under the given root prefix.
    #[must_use]
    pub fn new(
        jobs: Arc<dyn BatchJobApi>,
        objects: Arc<dyn ObjectStore>,
        root: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            objects,
            root: root.into(),
        }
    }

    /// Input object path for a batch.
    fn input_path(&self, tenant: &TenantId, batch_id: BatchId) -> String {
        format!("{}/{tenant}/{batch_id}/input.jsonl", self.root)
    }

    /// Output prefix for a batch. Embeds the batch id so location matching is
    /// unique per batch.
    fn output_prefix(&self, tenant: &TenantId, batch_id: BatchId) -> String {
        format!("{}/{tenant}/{batch_id}/out/", self.root)
    }

    /// Translates requests into the provider's JSONL wire format, remapping
    /// roles and lifting system instructions.
    fn translate(requests: &[InferenceRequest]) -> Result<Bytes> {
        let mut lines = Vec::with_capacity(requests.len());
        for request in requests {
            let mut system_texts = Vec::new();
            let mut contents = Vec::new();
            for message in &request.messages {
                match message.role {
                    Role::System => system_texts.push(message.content.clone()),
                    Role::User => contents.push(MediatedContent {
                        role: "user".to_string(),
                        parts: vec![MediatedPart {
                            text: message.content.clone(),
                        }],
                    }),
                    // This provider has no assistant role token.
                    Role::Assistant => contents.push(MediatedContent {
                        role: "model".to_string(),
                        parts: vec![MediatedPart {
                            text: message.content.clone(),
                        }],
                    }),
                }
            }
            let system_instruction = if system_texts.is_empty() {
                None
            } else {
                Some(MediatedContent {
                    role: "system".to_string(),
                    parts: system_texts
                        .into_iter()
                        .map(|text| MediatedPart { text })
                        .collect(),
                })
            };
            let line = MediatedLine {
                custom_id: request.custom_id.clone(),
                request: MediatedRequest {
                    system_instruction,
                    contents,
                },
            };
            let encoded = serde_json::to_string(&line).map_err(|err| {
                Error::translation(format!(
                    "failed to encode request {}: {err}",
                    request.custom_id
                ))
            })?;
            lines.push(encoded);
        }
        Ok(Bytes::from(lines.join("\n")))
    }
}

#[async_trait]
impl BatchAdapter for ObjectStoreAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::ObjectStoreMediated
    }

    async fn submit(
        &self,
        batch_id: BatchId,
        tenant: &TenantId,
        requests: &[InferenceRequest],
    ) -> Result<ProviderSubmission> {
        let payload = Self::translate(requests)?;
        tracing::debug!(batch = %batch_id, tenant = %tenant, bytes = payload.len(), "payload translated");

        let input_path = self.input_path(tenant, batch_id);
        let output_prefix = self.output_prefix(tenant, batch_id);
        self.objects
            .put(&input_path, payload)
            .await
            .map_err(|err| Error::transient_with_source("staging upload failed", err))?;
        tracing::debug!(batch = %batch_id, path = %input_path, "payload staged");

        let model = requests
            .first()
            .map(|request| request.model.clone())
            .ok_or_else(|| Error::invalid_submission("no requests to submit"))?;
        let handle = self
            .jobs
            .create_job(&model, &input_path, &output_prefix)
            .await?;
        tracing::info!(batch = %batch_id, provider_batch = %handle.name, "provider job created");

        Ok(ProviderSubmission {
            provider_batch_id: handle.name,
            input_location: input_path,
            output_location: Some(output_prefix),
        })
    }

    async fn check_status(&self, provider_batch_id: &str) -> Result<ProviderJobState> {
        let handle = self.jobs.get_job(provider_batch_id).await?;
        Ok(handle.job_state())
    }

    async fn download(&self, batch: &BatchRecord) -> Result<Vec<Value>> {
        let Some(prefix) = &batch.output_location else {
            return Err(Error::permanent(format!(
                "batch {} has no output location",
                batch.id
            )));
        };
        let fragments = self
            .objects
            .list(prefix)
            .await
            .map_err(|err| Error::transient_with_source("listing output fragments failed", err))?;
        let mut results = Vec::new();
        for fragment in &fragments {
            let content = self
                .objects
                .get(&fragment.path)
                .await
                .map_err(|err| Error::transient_with_source("fetching output fragment failed", err))?;
            results.extend(parse_jsonl(&content)?);
        }
        Ok(sort_by_correlation_id(results))
    }

    async fn cleanup(&self, batch: &BatchRecord) -> Result<()> {
        self.objects
            .delete(&batch.input_location)
            .await
            .map_err(|err| Error::transient_with_source("deleting input object failed", err))?;
        if let Some(prefix) = &batch.output_location {
            let fragments = self
                .objects
                .list(prefix)
                .await
                .map_err(|err| Error::transient_with_source("listing output fragments failed", err))?;
            for fragment in fragments {
                self.objects
                    .delete(&fragment.path)
                    .await
                    .map_err(|err| {
                        Error::transient_with_source("deleting output fragment failed", err)
                    })?;
            }
        }
        Ok(())
    }

    async fn list_jobs_since(&self, since: DateTime<Utc>) -> Result<Vec<RemoteJob>> {
        let handles = self.jobs.list_jobs(since).await?;
        Ok(handles
            .into_iter()
            .map(|handle| RemoteJob {
                state: handle.job_state(),
                provider_batch_id: handle.name,
                model: handle.model.map(ModelId::new),
                created_at: handle.created_at,
                input_location: handle.input_uri,
                output_location: handle.output_prefix,
            })
            .collect())
    }
}

/// Configuration for the mediated provider's control-plane HTTP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJobApiConfig {
    /// API base URL.
    pub base_url: String,
    /// Bearer token.
    pub api_key: String,
    /// Timeout for control-plane calls.
    #[serde(default = "default_control_timeout")]
    pub control_timeout: Duration,
}

fn default_control_timeout() -> Duration {
    Duration::from_secs(15)
}

/// HTTP implementation of [`BatchJobApi`].
pub struct HttpBatchJobApi {
    config: BatchJobApiConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct JobListResponse {
    jobs: Vec<RemoteJobHandle>,
}

impl HttpBatchJobApi {
    /// Builds the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns a permanent error if the client cannot be constructed.
    pub fn new(config: BatchJobApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.control_timeout)
            .build()
            .map_err(|err| Error::permanent(format!("failed to build http client: {err}")))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl BatchJobApi for HttpBatchJobApi {
    async fn create_job(
        &self,
        model: &ModelId,
        input_uri: &str,
        output_prefix: &str,
    ) -> Result<RemoteJobHandle> {
        let response = self
            .client
            .post(self.url("/v1/batch-jobs"))
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({
                "model": model.as_str(),
                "inputUri": input_uri,
                "outputPrefix": output_prefix,
            }))
            .send()
            .await
            .map_err(|err| http_request_error("create job", err))?;
        if !response.status().is_success() {
            return Err(http_status_error("create job", response.status(), input_uri));
        }
        response
            .json()
            .await
            .map_err(|err| http_request_error("create job", err))
    }

    async fn get_job(&self, job_name: &str) -> Result<RemoteJobHandle> {
        let response = self
            .client
            .get(self.url(&format!("/v1/{job_name}")))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|err| http_request_error("get job", err))?;
        if !response.status().is_success() {
            return Err(http_status_error("get job", response.status(), job_name));
        }
        response
            .json()
            .await
            .map_err(|err| http_request_error("get job", err))
    }

    async fn list_jobs(&self, created_after: DateTime<Utc>) -> Result<Vec<RemoteJobHandle>> {
        let response = self
            .client
            .get(self.url("/v1/batch-jobs"))
            .bearer_auth(&self.config.api_key)
            .query(&[("createdAfter", created_after.to_rfc3339())])
            .send()
            .await
            .map_err(|err| http_request_error("list jobs", err))?;
        if !response.status().is_success() {
            return Err(http_status_error("list jobs", response.status(), "jobs"));
        }
        let list: JobListResponse = response
            .json()
            .await
            .map_err(|err| http_request_error("list jobs", err))?;
        Ok(list.jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Message;
    use serde_json::json;

    #[test]
    fn translation_remaps_assistant_and_lifts_system() {
        let requests = vec![InferenceRequest::new(
            "r1",
            "gemini-2.0-flash",
            vec![
                Message::system("be terse"),
                Message::user("hello"),
                Message::assistant("hi"),
                Message::user("continue"),
            ],
        )];

        let payload = ObjectStoreAdapter::translate(&requests).unwrap();
        let line: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(line["customId"], "r1");
        // System text is lifted out of the message list.
        assert_eq!(
            line["request"]["systemInstruction"]["parts"][0]["text"],
            "be terse"
        );
        let contents = line["request"]["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        // The assistant role becomes this provider's "model" token.
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "user");
    }

    #[test]
    fn translation_omits_absent_system_instruction() {
        let requests = vec![InferenceRequest::new(
            "r1",
            "gemini-2.0-flash",
            vec![Message::user("hello")],
        )];
        let payload = ObjectStoreAdapter::translate(&requests).unwrap();
        let line: Value = serde_json::from_slice(&payload).unwrap();
        assert!(line["request"].get("systemInstruction").is_none());
    }

    #[test]
    fn paths_embed_tenant_and_batch_id() {
        let adapter = ObjectStoreAdapter::new(
            Arc::new(super::super::memory::InMemoryBatchJobApi::new()),
            Arc::new(trellis_core::MemoryObjectStore::new()),
            "batches",
        );
        let tenant = TenantId::new("acme").unwrap();
        let batch_id = BatchId::generate();

        let input = adapter.input_path(&tenant, batch_id);
        let output = adapter.output_prefix(&tenant, batch_id);
        assert_eq!(input, format!("batches/acme/{batch_id}/input.jsonl"));
        assert_eq!(output, format!("batches/acme/{batch_id}/out/"));
    }

    #[test]
    fn job_state_normalization() {
        let handle = RemoteJobHandle {
            name: "jobs/1".to_string(),
            state: "running".to_string(),
            model: None,
            created_at: Utc::now(),
            input_uri: None,
            output_prefix: None,
            error: None,
        };
        assert_eq!(handle.job_state(), ProviderJobState::Running);

        let failed = RemoteJobHandle {
            state: "cancelled".to_string(),
            error: None,
            ..handle
        };
        assert_eq!(
            failed.job_state(),
            ProviderJobState::Failed {
                reason: "job ended in state cancelled".to_string()
            }
        );
    }

    #[test]
    fn remote_handle_serde_round_trip() {
        let handle = RemoteJobHandle {
            name: "jobs/7".to_string(),
            state: "succeeded".to_string(),
            model: Some("gemini-2.0-flash".to_string()),
            created_at: Utc::now(),
            input_uri: Some("batches/acme/x/input.jsonl".to_string()),
            output_prefix: Some("batches/acme/x/out/".to_string()),
            error: None,
        };
        let value = serde_json::to_value(&handle).unwrap();
        assert_eq!(value["outputPrefix"], json!("batches/acme/x/out/"));
        let parsed: RemoteJobHandle = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.name, "jobs/7");
    }
}
