//! Job handler registry and execution loop.
//!
//! The runner is the in-process delivery side of the queue: handlers register
//! by job name, and `run_pending` pulls queued jobs and executes them,
//! re-queueing failures until the attempt budget is spent. Delivery is
//! at-least-once; handlers must be idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::JobPayload;
use super::memory::MemoryJobQueue;
use crate::error::Result;

/// A registered job handler.
///
/// Handlers signal completion or failure explicitly through their return
/// value; a failure triggers redelivery under the queue's retry policy.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Executes one delivery of a job.
    async fn run(&self, payload: &JobPayload) -> Result<()>;
}

/// Outcome counters for one execution pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Jobs that completed successfully.
    pub executed: usize,
    /// Jobs re-queued for another attempt.
    pub retried: usize,
    /// Jobs dropped after exhausting their attempt budget.
    pub failed: usize,
    /// Jobs dropped because no handler is registered.
    pub unroutable: usize,
}

/// Registry of job handlers plus the execution loop.
pub struct JobRunner {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    max_attempts: u32,
}

impl JobRunner {
    /// Creates a runner with the given per-job attempt budget.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            handlers: HashMap::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Registers a handler for a job name, replacing any previous handler.
    pub fn register(&mut self, job_name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_name.into(), handler);
    }

    /// Returns whether a handler is registered for the job name.
    #[must_use]
    pub fn handles(&self, job_name: &str) -> bool {
        self.handlers.contains_key(job_name)
    }

    /// Executes queued jobs until the queue is empty.
    ///
    /// Failed jobs are re-queued and retried within this same pass until the
    /// attempt budget is spent.
    pub async fn run_pending(&self, queue: &MemoryJobQueue) -> Result<RunStats> {
        let mut stats = RunStats::default();
        while let Some(message) = queue.take()? {
            let Some(handler) = self.handlers.get(&message.payload.job_name) else {
                tracing::warn!(job = %message.payload.job_name, "no handler registered, dropping job");
                stats.unroutable += 1;
                continue;
            };
            match handler.run(&message.payload).await {
                Ok(()) => {
                    tracing::debug!(
                        job = %message.payload.job_name,
                        document = %message.payload.document_id,
                        attempt = message.attempt,
                        "job completed"
                    );
                    stats.executed += 1;
                }
                Err(err) if message.attempt < self.max_attempts => {
                    tracing::warn!(
                        job = %message.payload.job_name,
                        attempt = message.attempt,
                        error = %err,
                        "job failed, re-queueing"
                    );
                    queue.requeue(message)?;
                    stats.retried += 1;
                }
                Err(err) => {
                    tracing::error!(
                        job = %message.payload.job_name,
                        attempts = message.attempt,
                        error = %err,
                        "job failed permanently"
                    );
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::queue::JobQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl CountingHandler {
        fn new(fail_first: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn run(&self, payload: &JobPayload) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(Error::handler(payload.job_name.clone(), "induced failure"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn executes_registered_handlers() -> Result<()> {
        let queue = MemoryJobQueue::new("q");
        queue
            .enqueue_now(JobPayload::new("j", None, "d-1", None))
            .await?;

        let handler = Arc::new(CountingHandler::new(0));
        let mut runner = JobRunner::new(3);
        runner.register("j", Arc::clone(&handler) as Arc<dyn JobHandler>);

        let stats = runner.run_pending(&queue).await?;
        assert_eq!(stats.executed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn retries_until_success() -> Result<()> {
        let queue = MemoryJobQueue::new("q");
        queue
            .enqueue_now(JobPayload::new("j", None, "d-1", None))
            .await?;

        let handler = Arc::new(CountingHandler::new(2));
        let mut runner = JobRunner::new(5);
        runner.register("j", Arc::clone(&handler) as Arc<dyn JobHandler>);

        let stats = runner.run_pending(&queue).await?;
        assert_eq!(stats.executed, 1);
        assert_eq!(stats.retried, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn drops_after_attempt_budget() -> Result<()> {
        let queue = MemoryJobQueue::new("q");
        queue
            .enqueue_now(JobPayload::new("j", None, "d-1", None))
            .await?;

        let handler = Arc::new(CountingHandler::new(usize::MAX));
        let mut runner = JobRunner::new(3);
        runner.register("j", Arc::clone(&handler) as Arc<dyn JobHandler>);

        let stats = runner.run_pending(&queue).await?;
        assert_eq!(stats.executed, 0);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn unroutable_jobs_are_dropped() -> Result<()> {
        let queue = MemoryJobQueue::new("q");
        queue
            .enqueue_now(JobPayload::new("unknown", None, "d-1", None))
            .await?;

        let runner = JobRunner::new(3);
        let stats = runner.run_pending(&queue).await?;
        assert_eq!(stats.unroutable, 1);
        assert_eq!(queue.queue_depth().await?, 0);
        Ok(())
    }
}
