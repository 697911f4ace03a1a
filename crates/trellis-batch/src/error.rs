//! Error taxonomy for the batch lifecycle.
//!
//! The taxonomy matters operationally:
//!
//! - **Transient provider errors** (network, 5xx) are retried with backoff
//!   and cause no state transition
//! - **Permanent provider errors** (4xx, job-not-found) move the batch to
//!   `failed` with a recorded reason
//! - **Persistence errors** after provider acceptance are retried until they
//!   succeed: the provider-side cost is already incurred, and abandoning the
//!   write would orphan a paid job

/// The result type used throughout trellis-batch.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in batch lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A provider call failed in a way that is expected to succeed on retry.
    #[error("transient provider error: {message}")]
    TransientProvider {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A provider call failed in a way that retrying cannot fix.
    #[error("permanent provider error: {message}")]
    PermanentProvider {
        /// Description of the failure.
        message: String,
    },

    /// The provider does not know the referenced job. Provider job ids are
    /// never reused, so this is permanent, distinct from a transient
    /// connectivity failure.
    #[error("provider job not found: {provider_batch_id}")]
    JobNotFound {
        /// The provider-side job identifier that was looked up.
        provider_batch_id: String,
    },

    /// A store write failed after the provider already accepted work.
    #[error("persistence error: {message}")]
    Persistence {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Requests could not be translated into the provider's wire format.
    #[error("translation error: {message}")]
    Translation {
        /// Description of the failure.
        message: String,
    },

    /// The submission itself is invalid (empty, mixed providers, duplicate
    /// correlation ids).
    #[error("invalid submission: {message}")]
    InvalidSubmission {
        /// Description of the problem.
        message: String,
    },

    /// An error from trellis-core.
    #[error(transparent)]
    Core(#[from] trellis_core::Error),
}

impl Error {
    /// Creates a new transient provider error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientProvider {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new transient provider error with a source cause.
    #[must_use]
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransientProvider {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new permanent provider error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::PermanentProvider {
            message: message.into(),
        }
    }

    /// Creates a new job-not-found error.
    #[must_use]
    pub fn job_not_found(provider_batch_id: impl Into<String>) -> Self {
        Self::JobNotFound {
            provider_batch_id: provider_batch_id.into(),
        }
    }

    /// Creates a new persistence error.
    #[must_use]
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new translation error.
    #[must_use]
    pub fn translation(message: impl Into<String>) -> Self {
        Self::Translation {
            message: message.into(),
        }
    }

    /// Creates a new invalid-submission error.
    #[must_use]
    pub fn invalid_submission(message: impl Into<String>) -> Self {
        Self::InvalidSubmission {
            message: message.into(),
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    ///
    /// Storage errors count as transient: the store being unreachable is a
    /// connectivity condition, not a property of the data.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientProvider { .. } | Self::Persistence { .. } | Self::Core(_)
        )
    }
}
