//! Direct-upload provider adapter.
//!
//! This provider exposes its own file API: the translated payload is uploaded
//! as a file, a batch job is created referencing that file, and results are
//! downloaded from a provider-assigned output file when the job completes.
//!
//! Requests translate to JSONL, one line per request, with roles passed
//! through unchanged and system instructions kept in the message list.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use trellis_core::id::{BatchId, TenantId};

use super::{
    BatchAdapter, ProviderJobState, ProviderKind, ProviderSubmission, RemoteJob,
    http_request_error, http_status_error, parse_jsonl, sort_by_correlation_id,
};
use crate::error::{Error, Result};
use crate::record::BatchRecord;
use crate::request::{InferenceRequest, Message};

/// A provider-side batch job as returned by the direct API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteBatch {
    /// Provider-assigned job id.
    pub id: String,
    /// Provider status string (`validating`, `in_progress`, `completed`, ...).
    pub status: String,
    /// When the provider created the job.
    pub created_at: DateTime<Utc>,
    /// The uploaded input file.
    pub input_file_id: String,
    /// The output file, present once results exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_id: Option<String>,
    /// Provider-reported error for failed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RemoteBatch {
    /// Normalizes the provider status string.
    #[must_use]
    pub fn state(&self) -> ProviderJobState {
        match self.status.as_str() {
            "validating" | "queued" => ProviderJobState::Pending,
            "in_progress" | "finalizing" => ProviderJobState::Running,
            "completed" => ProviderJobState::Succeeded,
            other => ProviderJobState::Failed {
                reason: self
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("job ended in state {other}")),
            },
        }
    }
}

/// The direct provider's API surface.
///
/// Kept narrow so tests can fake it; see
/// [`super::memory::InMemoryDirectApi`].
#[async_trait]
pub trait DirectBatchApi: Send + Sync {
    /// Uploads a payload, returning the provider's file id.
    async fn upload_file(&self, content: Bytes, purpose: &str) -> Result<String>;

    /// Creates a batch job over an uploaded file.
    async fn create_batch(&self, input_file_id: &str, endpoint: &str) -> Result<RemoteBatch>;

    /// Reads a batch job.
    async fn get_batch(&self, batch_id: &str) -> Result<RemoteBatch>;

    /// Lists batch jobs created after the given instant.
    async fn list_batches(&self, created_after: DateTime<Utc>) -> Result<Vec<RemoteBatch>>;

    /// Downloads a file's content.
    async fn download_file(&self, file_id: &str) -> Result<Bytes>;

    /// Deletes a file. Deleting an absent file is not an error.
    async fn delete_file(&self, file_id: &str) -> Result<()>;
}

/// One JSONL line of the direct provider's batch input format.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchLine<'a> {
    custom_id: &'a str,
    method: &'static str,
    url: &'a str,
    body: BatchLineBody<'a>,
}

#[derive(Serialize)]
struct BatchLineBody<'a> {
    model: &'a str,
    messages: &'a [Message],
}

/// Adapter for the direct-upload provider.
pub struct DirectUploadAdapter {
    api: Arc<dyn DirectBatchApi>,
    endpoint: String,
}

impl DirectUploadAdapter {
    /// Creates an adapter submitting batches against the given inference
    /// endpoint path.
    #[must_use]
    pub fn new(api: Arc<dyn DirectBatchApi>, endpoint: impl Into<String>) -> Self {
        Self {
            api,
            endpoint: endpoint.into(),
        }
    }

    /// Translates requests into the provider's JSONL wire format.
    fn translate(&self, requests: &[InferenceRequest]) -> Result<Bytes> {
        let mut lines = Vec::with_capacity(requests.len());
        for request in requests {
            let line = BatchLine {
                custom_id: &request.custom_id,
                method: "POST",
                url: &self.endpoint,
                body: BatchLineBody {
                    model: request.model.as_str(),
                    messages: &request.messages,
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
impl BatchAdapter for DirectUploadAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::DirectUpload
    }

    async fn submit(
        &self,
        batch_id: BatchId,
        tenant: &TenantId,
        requests: &[InferenceRequest],
    ) -> Result<ProviderSubmission> {
        let payload = self.translate(requests)?;
        tracing::debug!(batch = %batch_id, tenant = %tenant, bytes = payload.len(), "payload translated");

        let input_file_id = self.api.upload_file(payload, "batch").await?;
        tracing::debug!(batch = %batch_id, file = %input_file_id, "payload staged");

        let remote = self.api.create_batch(&input_file_id, &self.endpoint).await?;
        tracing::info!(batch = %batch_id, provider_batch = %remote.id, "provider job created");

        Ok(ProviderSubmission {
            provider_batch_id: remote.id,
            input_location: input_file_id,
            // The direct provider assigns the output file at completion.
            output_location: remote.output_file_id,
        })
    }

    async fn check_status(&self, provider_batch_id: &str) -> Result<ProviderJobState> {
        let remote = self.api.get_batch(provider_batch_id).await?;
        Ok(remote.state())
    }

    async fn download(&self, batch: &BatchRecord) -> Result<Vec<Value>> {
        let remote = self.api.get_batch(&batch.provider_batch_id).await?;
        let Some(output_file_id) = remote.output_file_id else {
            return Err(Error::transient(format!(
                "batch {} has no output file yet",
                batch.provider_batch_id
            )));
        };
        let content = self.api.download_file(&output_file_id).await?;
        let results = parse_jsonl(&content)?;
        Ok(sort_by_correlation_id(results))
    }

    async fn cleanup(&self, batch: &BatchRecord) -> Result<()> {
        self.api.delete_file(&batch.input_location).await?;
        let output_file_id = match &batch.output_location {
            Some(location) => Some(location.clone()),
            None => match self.api.get_batch(&batch.provider_batch_id).await {
                Ok(remote) => remote.output_file_id,
                Err(Error::JobNotFound { .. }) => None,
                Err(err) => return Err(err),
            },
        };
        if let Some(output_file_id) = output_file_id {
            self.api.delete_file(&output_file_id).await?;
        }
        Ok(())
    }

    async fn list_jobs_since(&self, since: DateTime<Utc>) -> Result<Vec<RemoteJob>> {
        let remotes = self.api.list_batches(since).await?;
        Ok(remotes
            .into_iter()
            .map(|remote| RemoteJob {
                state: remote.state(),
                provider_batch_id: remote.id,
                model: None,
                created_at: remote.created_at,
                input_location: Some(remote.input_file_id),
                output_location: remote.output_file_id,
            })
            .collect())
    }
}

/// Configuration for the direct provider's HTTP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectApiConfig {
    /// API base URL.
    pub base_url: String,
    /// Bearer token.
    pub api_key: String,
    /// Timeout for control-plane calls (upload, create, status).
    #[serde(default = "default_control_timeout")]
    pub control_timeout: Duration,
    /// Timeout for bulk result downloads.
    #[serde(default = "default_download_timeout")]
    pub download_timeout: Duration,
}

fn default_control_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_download_timeout() -> Duration {
    Duration::from_secs(300)
}

/// HTTP implementation of [`DirectBatchApi`].
pub struct HttpDirectBatchApi {
    config: DirectApiConfig,
    control: reqwest::Client,
    download: reqwest::Client,
}

#[derive(Deserialize)]
struct FileResponse {
    id: String,
}

#[derive(Deserialize)]
struct BatchListResponse {
    data: Vec<RemoteBatch>,
}

impl HttpDirectBatchApi {
    /// Builds the HTTP clients.
    ///
    /// # Errors
    ///
    /// Returns a permanent error if a client cannot be constructed.
    pub fn new(config: DirectApiConfig) -> Result<Self> {
        let control = reqwest::Client::builder()
            .timeout(config.control_timeout)
            .build()
            .map_err(|err| Error::permanent(format!("failed to build http client: {err}")))?;
        let download = reqwest::Client::builder()
            .timeout(config.download_timeout)
            .build()
            .map_err(|err| Error::permanent(format!("failed to build http client: {err}")))?;
        Ok(Self {
            config,
            control,
            download,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl DirectBatchApi for HttpDirectBatchApi {
    async fn upload_file(&self, content: Bytes, purpose: &str) -> Result<String> {
        let response = self
            .control
            .post(self.url("/v1/files"))
            .bearer_auth(&self.config.api_key)
            .query(&[("purpose", purpose)])
            .header(reqwest::header::CONTENT_TYPE, "application/jsonl")
            .body(content)
            .send()
            .await
            .map_err(|err| http_request_error("upload file", err))?;
        if !response.status().is_success() {
            return Err(http_status_error("upload file", response.status(), "file"));
        }
        let file: FileResponse = response
            .json()
            .await
            .map_err(|err| http_request_error("upload file", err))?;
        Ok(file.id)
    }

    async fn create_batch(&self, input_file_id: &str, endpoint: &str) -> Result<RemoteBatch> {
        let response = self
            .control
            .post(self.url("/v1/batches"))
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({
                "inputFileId": input_file_id,
                "endpoint": endpoint,
            }))
            .send()
            .await
            .map_err(|err| http_request_error("create batch", err))?;
        if !response.status().is_success() {
            return Err(http_status_error("create batch", response.status(), input_file_id));
        }
        response
            .json()
            .await
            .map_err(|err| http_request_error("create batch", err))
    }

    async fn get_batch(&self, batch_id: &str) -> Result<RemoteBatch> {
        let response = self
            .control
            .get(self.url(&format!("/v1/batches/{batch_id}")))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|err| http_request_error("get batch", err))?;
        if !response.status().is_success() {
            return Err(http_status_error("get batch", response.status(), batch_id));
        }
        response
            .json()
            .await
            .map_err(|err| http_request_error("get batch", err))
    }

    async fn list_batches(&self, created_after: DateTime<Utc>) -> Result<Vec<RemoteBatch>> {
        let response = self
            .control
            .get(self.url("/v1/batches"))
            .bearer_auth(&self.config.api_key)
            .query(&[("createdAfter", created_after.to_rfc3339())])
            .send()
            .await
            .map_err(|err| http_request_error("list batches", err))?;
        if !response.status().is_success() {
            return Err(http_status_error("list batches", response.status(), "batches"));
        }
        let list: BatchListResponse = response
            .json()
            .await
            .map_err(|err| http_request_error("list batches", err))?;
        Ok(list.data)
    }

    async fn download_file(&self, file_id: &str) -> Result<Bytes> {
        let response = self
            .download
            .get(self.url(&format!("/v1/files/{file_id}/content")))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|err| http_request_error("download file", err))?;
        if !response.status().is_success() {
            return Err(http_status_error("download file", response.status(), file_id));
        }
        response
            .bytes()
            .await
            .map_err(|err| http_request_error("download file", err))
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        let response = self
            .control
            .delete(self.url(&format!("/v1/files/{file_id}")))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|err| http_request_error("delete file", err))?;
        // Already deleted is success: cleanup must be idempotent.
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(http_status_error("delete file", response.status(), file_id));
        }
        Ok(())
    }
}
