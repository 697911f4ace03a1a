//! Typed access to the rule collection, including the lock protocol.
//!
//! ## Lock Protocol
//!
//! Acquisition is a single atomic conditional update: set `lock.ownerId` and
//! `lock.lastHeartbeat` only if the lock is absent, stale, or already ours.
//! Renewal is the same update guarded by `lock.ownerId == self`; a failed
//! renewal means a peer stole the lock after a missed heartbeat, and the
//! local subscription must stand down immediately (fencing). The store's
//! compare-and-set is the entire mutual-exclusion mechanism; no timing
//! assumptions are involved.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use trellis_core::document::{CasOutcome, Condition, Document, DocumentStore, FieldUpdate, ResumeToken};
use trellis_core::id::RuleId;

use crate::error::Result;
use crate::rule::ListenerRule;

/// Collection holding listener rule documents (shared partition).
pub const RULES_COLLECTION: &str = "listener_rules";

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// This instance now owns the rule.
    Acquired,
    /// A peer holds a live lock; stand down without retrying immediately.
    Held {
        /// The current owner, if readable.
        owner: Option<String>,
    },
}

impl LockAttempt {
    /// Returns true if the lock was acquired.
    #[must_use]
    pub const fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired)
    }
}

/// Result of a heartbeat renewal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    /// Heartbeat extended; ownership continues.
    Renewed,
    /// Ownership was lost to a peer; tear down the local subscription.
    Lost,
}

/// Typed wrapper over the shared store's rule collection.
#[derive(Clone)]
pub struct RuleStore {
    store: Arc<dyn DocumentStore>,
}

impl RuleStore {
    /// Creates a rule store over the shared partition.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Idempotently creates any seed rules that don't exist yet (matched by
    /// well-known name) and returns the resulting number of active rules.
    pub async fn seed_defaults(&self, seeds: &[ListenerRule]) -> Result<usize> {
        for seed in seeds {
            let existing = self
                .store
                .find(RULES_COLLECTION, &Condition::equals("name", seed.name.clone()))
                .await?;
            if existing.is_empty() {
                self.store
                    .insert(RULES_COLLECTION, Document::encode(seed)?)
                    .await?;
                tracing::info!(rule = %seed.name, "seeded listener rule");
            }
        }
        Ok(self.active_rules().await?.len())
    }

    /// Returns all active rules.
    pub async fn active_rules(&self) -> Result<Vec<ListenerRule>> {
        let docs = self
            .store
            .find(RULES_COLLECTION, &Condition::equals("isActive", true))
            .await?;
        let mut rules = Vec::with_capacity(docs.len());
        for doc in docs {
            rules.push(doc.decode::<ListenerRule>()?);
        }
        Ok(rules)
    }

    /// Gets a rule by id.
    pub async fn get(&self, id: RuleId) -> Result<Option<ListenerRule>> {
        let doc = self.store.get(RULES_COLLECTION, &id.to_string()).await?;
        Ok(match doc {
            Some(doc) => Some(doc.decode()?),
            None => None,
        })
    }

    /// Inserts a new rule document.
    pub async fn insert(&self, rule: &ListenerRule) -> Result<()> {
        self.store
            .insert(RULES_COLLECTION, Document::encode(rule)?)
            .await?;
        Ok(())
    }

    /// Soft-disables a rule. The document is kept; referenced rules are never
    /// hard-deleted.
    pub async fn deactivate(&self, id: RuleId) -> Result<CasOutcome> {
        Ok(self
            .store
            .update_if(
                RULES_COLLECTION,
                &id.to_string(),
                &Condition::True,
                &[FieldUpdate::set("isActive", false)],
            )
            .await?)
    }

    /// Attempts to take ownership of a rule.
    ///
    /// Succeeds when the lock is absent, stale (heartbeat older than
    /// `lock_timeout`), or already held by `owner` (re-acquisition extends
    /// the heartbeat).
    pub async fn try_acquire(
        &self,
        id: RuleId,
        owner: &str,
        lock_timeout: Duration,
    ) -> Result<LockAttempt> {
        let now = Utc::now();
        let stale_before = now
            - chrono::Duration::from_std(lock_timeout).unwrap_or(chrono::Duration::seconds(30));
        let expected = Condition::Any(vec![
            Condition::Missing("lock.ownerId".to_string()),
            Condition::OlderThan("lock.lastHeartbeat".to_string(), stale_before),
            Condition::equals("lock.ownerId", owner),
        ]);
        let updates = [
            FieldUpdate::set("lock.ownerId", owner),
            FieldUpdate::set("lock.lastHeartbeat", timestamp(now)),
        ];
        match self
            .store
            .update_if(RULES_COLLECTION, &id.to_string(), &expected, &updates)
            .await?
        {
            CasOutcome::Applied => Ok(LockAttempt::Acquired),
            CasOutcome::PreconditionFailed => {
                let owner = self
                    .get(id)
                    .await?
                    .and_then(|rule| rule.lock.map(|lock| lock.owner_id));
                Ok(LockAttempt::Held { owner })
            }
            CasOutcome::NotFound => Err(trellis_core::Error::not_found("rule", id).into()),
        }
    }

    /// Renews the heartbeat for a held lock.
    ///
    /// `Lost` means a peer stole ownership; the caller must stop dispatching
    /// for this rule before its next event.
    pub async fn renew(&self, id: RuleId, owner: &str) -> Result<RenewOutcome> {
        let expected = Condition::equals("lock.ownerId", owner);
        let updates = [FieldUpdate::set("lock.lastHeartbeat", timestamp(Utc::now()))];
        match self
            .store
            .update_if(RULES_COLLECTION, &id.to_string(), &expected, &updates)
            .await?
        {
            CasOutcome::Applied => Ok(RenewOutcome::Renewed),
            CasOutcome::PreconditionFailed | CasOutcome::NotFound => Ok(RenewOutcome::Lost),
        }
    }

    /// Releases a held lock so a peer can take over immediately instead of
    /// waiting out the lock timeout. A no-op if the lock is no longer ours.
    pub async fn release(&self, id: RuleId, owner: &str) -> Result<bool> {
        let expected = Condition::equals("lock.ownerId", owner);
        let outcome = self
            .store
            .update_if(
                RULES_COLLECTION,
                &id.to_string(),
                &expected,
                &[FieldUpdate::Unset("lock".to_string())],
            )
            .await?;
        Ok(outcome.is_applied())
    }

    /// Persists the latest dispatched change-stream position for a rule.
    ///
    /// Written only by the lock owner, after the corresponding job is
    /// enqueued, so a restart re-delivers at most the last event.
    pub async fn save_resume_token(&self, id: RuleId, token: &ResumeToken) -> Result<()> {
        self.store
            .update_if(
                RULES_COLLECTION,
                &id.to_string(),
                &Condition::True,
                &[FieldUpdate::set("resumeToken", token.as_str())],
            )
            .await?;
        Ok(())
    }
}

/// Serializes a timestamp the way chrono's serde does, so conditional reads
/// and typed decodes agree on the format.
fn timestamp(at: chrono::DateTime<Utc>) -> Value {
    serde_json::to_value(at).unwrap_or(Value::Null)
}
