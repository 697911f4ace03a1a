//! Dispatcher configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the change dispatcher.
///
/// Durations come from configuration files, so every field has a production
/// default and the whole struct deserializes from an empty object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherConfig {
    /// How stale a rule lock's heartbeat may be before a peer may steal it.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: Duration,
    /// How often a lock holder renews its heartbeat. Must satisfy
    /// `heartbeat_interval * 2 <= lock_timeout`.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
    /// How often the dispatcher retries rules whose locks were contended and
    /// prunes watches that have stopped.
    #[serde(default = "default_reacquire_interval")]
    pub reacquire_interval: Duration,
    /// Base delay for subscription retry backoff.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: Duration,
    /// Cap for subscription retry backoff.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap: Duration,
    /// Maximum delivery attempts for a job before it is dropped as failed.
    #[serde(default = "default_max_job_attempts")]
    pub max_job_attempts: u32,
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_reacquire_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(30)
}

fn default_max_job_attempts() -> u32 {
    5
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lock_timeout: default_lock_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            reacquire_interval: default_reacquire_interval(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            max_job_attempts: default_max_job_attempts(),
        }
    }
}

impl DispatcherConfig {
    /// Validates interval relationships.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the heartbeat interval is not comfortably
    /// inside the lock timeout, which would make spurious lock theft routine.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.checked_mul(2).unwrap_or(Duration::MAX) > self.lock_timeout {
            return Err(Error::config(format!(
                "heartbeat interval {:?} must be at most half the lock timeout {:?}",
                self.heartbeat_interval, self.lock_timeout
            )));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(Error::config(format!(
                "backoff base {:?} exceeds cap {:?}",
                self.backoff_base, self.backoff_cap
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(DispatcherConfig::default().validate().is_ok());
    }

    #[test]
    fn deserializes_from_empty_object() {
        let config: DispatcherConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.max_job_attempts, 5);
    }

    #[test]
    fn rejects_heartbeat_slower_than_lock_timeout() {
        let config = DispatcherConfig {
            lock_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(8),
            ..DispatcherConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_backoff() {
        let config = DispatcherConfig {
            backoff_base: Duration::from_secs(60),
            ..DispatcherConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
