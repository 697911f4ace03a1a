//! Error types for the dispatch domain.

/// The result type used throughout trellis-dispatch.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in dispatch operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A job queue operation failed.
    #[error("queue error: {message}")]
    Queue {
        /// Description of the queue failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A job handler reported failure; the queue's retry policy applies.
    #[error("job {job_name} failed: {message}")]
    Handler {
        /// Name of the failing job.
        job_name: String,
        /// Description of the failure.
        message: String,
    },

    /// The dispatcher configuration is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from trellis-core.
    #[error(transparent)]
    Core(#[from] trellis_core::Error),
}

impl Error {
    /// Creates a new queue error.
    #[must_use]
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new handler error.
    #[must_use]
    pub fn handler(job_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            job_name: job_name.into(),
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_display() {
        let err = Error::handler("poll-open-batches", "provider unreachable");
        assert!(err.to_string().contains("poll-open-batches"));
        assert!(err.to_string().contains("provider unreachable"));
    }

    #[test]
    fn core_error_passes_through() {
        let err: Error = trellis_core::Error::storage("down").into();
        assert!(err.to_string().contains("storage error"));
    }
}
