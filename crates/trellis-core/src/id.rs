//! Strongly-typed identifiers for Trellis entities.
//!
//! All identifiers are:
//! - **Strongly typed**: prevents mixing up different id types at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: no coordination required for generation
//!
//! # Example
//!
//! ```rust
//! use trellis_core::id::{BatchId, RuleId};
//!
//! let batch = BatchId::generate();
//! let rule = RuleId::generate();
//!
//! // Ids are different types - this won't compile:
//! // let wrong: BatchId = rule;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for a listener rule.
///
/// Rules describe which collections and predicates should trigger which
/// background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(Ulid);

impl RuleId {
    /// Generates a new unique rule id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a rule id from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RuleId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_str(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid rule id: {e}"),
        })
    }
}

/// A unique identifier for a batch record.
///
/// Batches group inference requests submitted together to a provider. The id
/// is embedded in provider-side artifact paths so that location-based
/// reconciliation is unambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Ulid);

impl BatchId {
    /// Generates a new unique batch id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a batch id from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the id.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for BatchId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_str(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid batch id: {e}"),
        })
    }
}

/// A unique identifier for a provider completion notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(Ulid);

impl NotificationId {
    /// Generates a new unique notification id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a notification id from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for NotificationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_str(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid notification id: {e}"),
        })
    }
}

/// A validated tenant identifier.
///
/// Tenant ids name per-tenant data partitions and are embedded in storage
/// paths, so the character set is restricted to lowercase alphanumerics and
/// hyphens.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant id, validating the character set.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidId` if the id is empty or contains characters
    /// outside `[a-z0-9-]`.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidId {
                message: "tenant id must not be empty".to_string(),
            });
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::InvalidId {
                message: format!("tenant id {id:?} contains invalid characters"),
            });
        }
        Ok(Self(id))
    }

    /// Returns the tenant id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl FromStr for TenantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = BatchId::generate();
        let b = BatchId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn id_round_trips_through_string() {
        let id = RuleId::generate();
        let parsed: RuleId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn id_serde_is_transparent() {
        let id = NotificationId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn invalid_id_rejected() {
        let err = "not a ulid!".parse::<BatchId>().unwrap_err();
        assert!(matches!(err, Error::InvalidId { .. }));
    }

    #[test]
    fn batch_id_encodes_timestamp() {
        let id = BatchId::generate();
        assert!(id.timestamp_ms() > 0);
    }

    #[test]
    fn tenant_id_validation() {
        assert!(TenantId::new("acme-01").is_ok());
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("Acme").is_err());
        assert!(TenantId::new("a/b").is_err());
    }
}
