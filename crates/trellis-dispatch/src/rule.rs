//! Listener rule documents.
//!
//! A rule is data, not code: it names a collection, an operation-type set, a
//! predicate, and the job to enqueue when a matching change is observed. The
//! dispatcher's registry of active subscriptions is an index over these
//! documents, rebuilt incrementally as rules are inserted and removed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trellis_core::document::{Condition, OperationSet, ResumeToken, WatchSpec};
use trellis_core::id::{RuleId, TenantId};

/// Lock bookkeeping embedded in a rule document.
///
/// Ownership is live while `last_heartbeat` is younger than the configured
/// lock timeout; a peer may steal the lock once it goes stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleLock {
    /// Instance currently holding the rule.
    pub owner_id: String,
    /// Last successful heartbeat renewal.
    pub last_heartbeat: DateTime<Utc>,
}

impl RuleLock {
    /// Returns whether the lock is still live at `now`.
    #[must_use]
    pub fn is_live(&self, lock_timeout: std::time::Duration, now: DateTime<Utc>) -> bool {
        let age = now - self.last_heartbeat;
        age < chrono::Duration::from_std(lock_timeout).unwrap_or(chrono::Duration::seconds(30))
    }
}

/// One watched pattern: which changes, on which collection, trigger which job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerRule {
    /// Rule identifier (document key).
    pub id: RuleId,
    /// Well-known unique name, used by idempotent seeding.
    pub name: String,
    /// Collection the rule watches.
    pub target_collection: String,
    /// Tenant partition holding the collection; `None` means the shared
    /// partition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    /// Operation types the rule reacts to.
    pub operations: OperationSet,
    /// Server-side predicate over the changed document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Condition>,
    /// Job enqueued for each matching event.
    pub job_name: String,
    /// Soft-disable flag; inactive rules keep their document but get no
    /// subscription.
    pub is_active: bool,
    /// Current ownership, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<RuleLock>,
    /// Last change-stream position dispatched for this rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<ResumeToken>,
}

impl ListenerRule {
    /// Creates an active rule with a fresh id, watching inserts only.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        target_collection: impl Into<String>,
        job_name: impl Into<String>,
    ) -> Self {
        Self {
            id: RuleId::generate(),
            name: name.into(),
            target_collection: target_collection.into(),
            tenant_id: None,
            operations: OperationSet::INSERTS,
            predicate: None,
            job_name: job_name.into(),
            is_active: true,
            lock: None,
            resume_token: None,
        }
    }

    /// Scopes the rule to a tenant partition.
    #[must_use]
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant_id = Some(tenant);
        self
    }

    /// Sets the operation types the rule reacts to.
    #[must_use]
    pub const fn with_operations(mut self, operations: OperationSet) -> Self {
        self.operations = operations;
        self
    }

    /// Sets the server-side predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Condition) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Builds the watch spec for this rule, resuming from its persisted
    /// position.
    #[must_use]
    pub fn watch_spec(&self) -> WatchSpec {
        WatchSpec::new(self.target_collection.clone())
            .with_operations(self.operations)
            .with_filter(self.predicate.clone().unwrap_or(Condition::True))
            .resume_after(self.resume_token.clone())
    }

    /// Returns whether the rule is currently owned by a live lock at `now`.
    #[must_use]
    pub fn is_locked(&self, lock_timeout: std::time::Duration, now: DateTime<Utc>) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|lock| lock.is_live(lock_timeout, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lock_liveness_tracks_heartbeat_age() {
        let lock = RuleLock {
            owner_id: "i-1".to_string(),
            last_heartbeat: Utc::now() - chrono::Duration::seconds(60),
        };
        assert!(!lock.is_live(Duration::from_secs(30), Utc::now()));
        assert!(lock.is_live(Duration::from_secs(120), Utc::now()));
    }

    #[test]
    fn watch_spec_carries_rule_settings() {
        let rule = ListenerRule::new("n", "notifications", "process-provider-notification")
            .with_operations(OperationSet::WRITES)
            .with_predicate(Condition::equals("processed", false));

        let spec = rule.watch_spec();
        assert_eq!(spec.collection, "notifications");
        assert_eq!(spec.operations, OperationSet::WRITES);
        assert_eq!(spec.filter, Condition::equals("processed", false));
        assert!(spec.resume_after.is_none());
    }

    #[test]
    fn rule_serde_round_trip() {
        let rule = ListenerRule::new("n", "c", "j")
            .with_tenant(TenantId::new("acme").unwrap());
        let json = serde_json::to_string(&rule).unwrap();
        let parsed: ListenerRule = serde_json::from_str(&json).unwrap();
        assert_eq!(rule, parsed);
        // Optional fields are omitted, not null.
        assert!(!json.contains("\"lock\""));
        assert!(!json.contains("resumeToken"));
    }
}
