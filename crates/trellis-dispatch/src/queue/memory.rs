//! In-memory job queue implementation for testing.
//!
//! This module provides [`MemoryJobQueue`], an in-process implementation of
//! the [`JobQueue`] trait.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no persistence, no distribution
//! - **Single-process only**: jobs are not visible across process boundaries
//! - **Manual clock**: recurring jobs fire when [`MemoryJobQueue::fire_due`]
//!   is called, so tests control time explicitly

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use super::{EnqueueOutcome, JobPayload, JobQueue};
use crate::error::{Error, Result};

/// A queued job awaiting execution.
#[derive(Debug, Clone)]
pub struct JobMessage {
    /// Queue message id.
    pub message_id: String,
    /// Delivery attempt, 1-indexed.
    pub attempt: u32,
    /// The job payload.
    pub payload: JobPayload,
}

#[derive(Debug, Clone)]
struct RecurringJob {
    payload: JobPayload,
    interval: Duration,
    next_fire: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<JobMessage>,
    seen_keys: HashMap<String, String>,
    recurring: HashMap<String, RecurringJob>,
}

/// Converts a lock poison error to a queue error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::queue("job queue lock poisoned")
}

/// In-memory job queue for testing.
///
/// ## Example
///
/// ```rust
/// use trellis_dispatch::MemoryJobQueue;
///
/// let queue = MemoryJobQueue::new("test-queue");
/// // Enqueue jobs in tests...
/// ```
pub struct MemoryJobQueue {
    name: String,
    state: RwLock<QueueState>,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new("default")
    }
}

impl MemoryJobQueue {
    /// Creates a new in-memory job queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(QueueState::default()),
        }
    }

    fn generate_message_id() -> String {
        Ulid::new().to_string()
    }

    /// Takes the next job from the queue.
    ///
    /// Returns `None` if the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take(&self) -> Result<Option<JobMessage>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let message = state.queue.pop_front();
        if let Some(ref message) = message {
            state.seen_keys.remove(message.payload.dedupe_key());
        }
        drop(state);
        Ok(message)
    }

    /// Peeks at the next job without removing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn peek(&self) -> Result<Option<JobMessage>> {
        let state = self.state.read().map_err(poison_err)?;
        let message = state.queue.front().cloned();
        drop(state);
        Ok(message)
    }

    /// Re-queues a message for another delivery attempt. Retries bypass
    /// deduplication.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn requeue(&self, message: JobMessage) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.queue.push_back(JobMessage {
            attempt: message.attempt + 1,
            ..message
        });
        drop(state);
        Ok(())
    }

    /// Moves every recurring job whose schedule has elapsed at `now` onto the
    /// queue and returns how many fired.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fire_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().map_err(poison_err)?;
        let mut fired = Vec::new();
        for entry in state.recurring.values_mut() {
            if entry.next_fire <= now {
                entry.next_fire = now
                    + chrono::Duration::from_std(entry.interval)
                        .unwrap_or(chrono::Duration::seconds(60));
                fired.push(entry.payload.clone());
            }
        }
        let count = fired.len();
        for payload in fired {
            state.queue.push_back(JobMessage {
                message_id: Self::generate_message_id(),
                attempt: 1,
                payload,
            });
        }
        drop(state);
        Ok(count)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue_now(&self, payload: JobPayload) -> Result<EnqueueOutcome> {
        let mut state = self.state.write().map_err(poison_err)?;
        if let Some(existing) = state.seen_keys.get(payload.dedupe_key()) {
            let existing_message_id = existing.clone();
            drop(state);
            return Ok(EnqueueOutcome::Deduplicated {
                existing_message_id,
            });
        }
        let message_id = Self::generate_message_id();
        state
            .seen_keys
            .insert(payload.dedupe_key().to_string(), message_id.clone());
        state.queue.push_back(JobMessage {
            message_id: message_id.clone(),
            attempt: 1,
            payload,
        });
        drop(state);
        Ok(EnqueueOutcome::Enqueued { message_id })
    }

    async fn schedule_recurring(&self, payload: JobPayload, interval: Duration) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let next_fire = Utc::now()
            + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::seconds(60));
        state.recurring.insert(
            payload.job_name.clone(),
            RecurringJob {
                payload,
                interval,
                next_fire,
            },
        );
        drop(state);
        Ok(())
    }

    async fn cancel_recurring(&self, job_name: &str) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        let existed = state.recurring.remove(job_name).is_some();
        drop(state);
        Ok(existed)
    }

    async fn queue_depth(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        let depth = state.queue.len();
        drop(state);
        Ok(depth)
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}
