//! In-memory provider fakes for testing.
//!
//! These implement the provider API traits fully in process. Tests drive the
//! provider side explicitly: jobs stay in flight until a test hook completes
//! or fails them.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: nothing is actually inferred
//! - **Single-process only**: provider state is process-local

use std::collections::HashMap;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::direct::{DirectBatchApi, RemoteBatch};
use super::object_store::{BatchJobApi, RemoteJobHandle};
use crate::error::{Error, Result};
use crate::request::ModelId;

/// Converts a lock poison error to a transient error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::transient("provider fake lock poisoned")
}

#[derive(Default)]
struct DirectState {
    files: HashMap<String, Bytes>,
    batches: HashMap<String, RemoteBatch>,
    next_file: u64,
    next_batch: u64,
}

/// In-memory fake of the direct provider's API.
///
/// Batches are created `in_progress`; tests call
/// [`InMemoryDirectApi::complete_batch`] or
/// [`InMemoryDirectApi::fail_batch`] to finish them.
#[derive(Default)]
pub struct InMemoryDirectApi {
    state: Mutex<DirectState>,
    download_calls: AtomicUsize,
}

impl InMemoryDirectApi {
    /// Creates an empty fake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a batch completed, writing its results as an output file.
    ///
    /// # Errors
    ///
    /// Returns `JobNotFound` if the batch doesn't exist.
    pub fn complete_batch(&self, batch_id: &str, results: &[Value]) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.next_file += 1;
        let output_file_id = format!("file-{}", state.next_file);
        let lines: Vec<String> = results
            .iter()
            .map(|value| value.to_string())
            .collect();
        state
            .files
            .insert(output_file_id.clone(), Bytes::from(lines.join("\n")));
        let batch = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| Error::job_not_found(batch_id))?;
        batch.status = "completed".to_string();
        batch.output_file_id = Some(output_file_id);
        drop(state);
        Ok(())
    }

    /// Marks a batch failed with a reason.
    ///
    /// # Errors
    ///
    /// Returns `JobNotFound` if the batch doesn't exist.
    pub fn fail_batch(&self, batch_id: &str, reason: &str) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let batch = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| Error::job_not_found(batch_id))?;
        batch.status = "failed".to_string();
        batch.error = Some(reason.to_string());
        drop(state);
        Ok(())
    }

    /// Number of file downloads performed, for asserting idempotence.
    #[must_use]
    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    /// Number of files currently stored, for asserting cleanup.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn file_count(&self) -> Result<usize> {
        Ok(self.state.lock().map_err(poison_err)?.files.len())
    }
}

#[async_trait]
impl DirectBatchApi for InMemoryDirectApi {
    async fn upload_file(&self, content: Bytes, _purpose: &str) -> Result<String> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.next_file += 1;
        let file_id = format!("file-{}", state.next_file);
        state.files.insert(file_id.clone(), content);
        drop(state);
        Ok(file_id)
    }

    async fn create_batch(&self, input_file_id: &str, _endpoint: &str) -> Result<RemoteBatch> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if !state.files.contains_key(input_file_id) {
            return Err(Error::permanent(format!(
                "input file {input_file_id} does not exist"
            )));
        }
        state.next_batch += 1;
        let batch = RemoteBatch {
            id: format!("batch-{}", state.next_batch),
            status: "in_progress".to_string(),
            created_at: Utc::now(),
            input_file_id: input_file_id.to_string(),
            output_file_id: None,
            error: None,
        };
        state.batches.insert(batch.id.clone(), batch.clone());
        drop(state);
        Ok(batch)
    }

    async fn get_batch(&self, batch_id: &str) -> Result<RemoteBatch> {
        let state = self.state.lock().map_err(poison_err)?;
        let batch = state
            .batches
            .get(batch_id)
            .cloned()
            .ok_or_else(|| Error::job_not_found(batch_id))?;
        drop(state);
        Ok(batch)
    }

    async fn list_batches(&self, created_after: DateTime<Utc>) -> Result<Vec<RemoteBatch>> {
        let state = self.state.lock().map_err(poison_err)?;
        let mut batches: Vec<RemoteBatch> = state
            .batches
            .values()
            .filter(|batch| batch.created_at > created_after)
            .cloned()
            .collect();
        drop(state);
        batches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(batches)
    }

    async fn download_file(&self, file_id: &str) -> Result<Bytes> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().map_err(poison_err)?;
        let content = state
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| Error::permanent(format!("file {file_id} does not exist")))?;
        drop(state);
        Ok(content)
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.files.remove(file_id);
        drop(state);
        Ok(())
    }
}

#[derive(Default)]
struct JobState {
    jobs: HashMap<String, RemoteJobHandle>,
    next_job: u64,
}

/// In-memory fake of the storage-mediated provider's control plane.
///
/// Jobs are created `pending`; tests call
/// [`InMemoryBatchJobApi::succeed_job`] or
/// [`InMemoryBatchJobApi::fail_job`] to finish them (and write output
/// fragments to the object store themselves).
#[derive(Default)]
pub struct InMemoryBatchJobApi {
    state: Mutex<JobState>,
}

impl InMemoryBatchJobApi {
    /// Creates an empty fake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a job succeeded.
    ///
    /// # Errors
    ///
    /// Returns `JobNotFound` if the job doesn't exist.
    pub fn succeed_job(&self, job_name: &str) -> Result<()> {
        self.set_state(job_name, "succeeded", None)
    }

    /// Marks a job failed with a reason.
    ///
    /// # Errors
    ///
    /// Returns `JobNotFound` if the job doesn't exist.
    pub fn fail_job(&self, job_name: &str, reason: &str) -> Result<()> {
        self.set_state(job_name, "failed", Some(reason.to_string()))
    }

    fn set_state(&self, job_name: &str, state: &str, error: Option<String>) -> Result<()> {
        let mut jobs = self.state.lock().map_err(poison_err)?;
        let job = jobs
            .jobs
            .get_mut(job_name)
            .ok_or_else(|| Error::job_not_found(job_name))?;
        job.state = state.to_string();
        job.error = error;
        drop(jobs);
        Ok(())
    }
}

#[async_trait]
impl BatchJobApi for InMemoryBatchJobApi {
    async fn create_job(
        &self,
        model: &ModelId,
        input_uri: &str,
        output_prefix: &str,
    ) -> Result<RemoteJobHandle> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.next_job += 1;
        let handle = RemoteJobHandle {
            name: format!("jobs/{}", state.next_job),
            state: "pending".to_string(),
            model: Some(model.as_str().to_string()),
            created_at: Utc::now(),
            input_uri: Some(input_uri.to_string()),
            output_prefix: Some(output_prefix.to_string()),
            error: None,
        };
        state.jobs.insert(handle.name.clone(), handle.clone());
        drop(state);
        Ok(handle)
    }

    async fn get_job(&self, job_name: &str) -> Result<RemoteJobHandle> {
        let state = self.state.lock().map_err(poison_err)?;
        let handle = state
            .jobs
            .get(job_name)
            .cloned()
            .ok_or_else(|| Error::job_not_found(job_name))?;
        drop(state);
        Ok(handle)
    }

    async fn list_jobs(&self, created_after: DateTime<Utc>) -> Result<Vec<RemoteJobHandle>> {
        let state = self.state.lock().map_err(poison_err)?;
        let mut handles: Vec<RemoteJobHandle> = state
            .jobs
            .values()
            .filter(|handle| handle.created_at > created_after)
            .cloned()
            .collect();
        drop(state);
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn direct_fake_lifecycle() -> Result<()> {
        let api = InMemoryDirectApi::new();
        let file_id = api.upload_file(Bytes::from_static(b"{}"), "batch").await?;
        let batch = api.create_batch(&file_id, "/v1/chat/completions").await?;
        assert_eq!(batch.status, "in_progress");

        api.complete_batch(&batch.id, &[json!({"customId": "r1"})])?;
        let done = api.get_batch(&batch.id).await?;
        assert_eq!(done.status, "completed");

        let output = done.output_file_id.unwrap();
        let content = api.download_file(&output).await?;
        assert!(content.starts_with(b"{\"customId\":\"r1\"}"));
        assert_eq!(api.download_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn direct_fake_unknown_batch_is_not_found() {
        let api = InMemoryDirectApi::new();
        let err = api.get_batch("batch-404").await.unwrap_err();
        assert!(matches!(err, Error::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn job_fake_lifecycle() -> Result<()> {
        let api = InMemoryBatchJobApi::new();
        let handle = api
            .create_job(
                &ModelId::new("gemini-2.0-flash"),
                "batches/acme/x/input.jsonl",
                "batches/acme/x/out/",
            )
            .await?;
        assert_eq!(handle.state, "pending");

        api.succeed_job(&handle.name)?;
        assert_eq!(api.get_job(&handle.name).await?.state, "succeeded");

        api.fail_job(&handle.name, "quota")?;
        let failed = api.get_job(&handle.name).await?;
        assert_eq!(failed.state, "failed");
        assert_eq!(failed.error.as_deref(), Some("quota"));
        Ok(())
    }

    #[tokio::test]
    async fn listing_filters_by_creation_time() -> Result<()> {
        let api = InMemoryBatchJobApi::new();
        let before = Utc::now() - chrono::Duration::seconds(1);
        api.create_job(
            &ModelId::new("gemini-2.0-flash"),
            "in",
            "out/",
        )
        .await?;

        assert_eq!(api.list_jobs(before).await?.len(), 1);
        let after = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(api.list_jobs(after).await?.len(), 0);
        Ok(())
    }
}
