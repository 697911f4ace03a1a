//! The change dispatcher.
//!
//! Maintains one active subscription per owned rule and turns matching change
//! events into job-queue submissions. The registry of active subscriptions is
//! an index keyed by rule id, rebuilt incrementally: a meta-subscription on
//! the rule collection applies configuration changes without a restart, and a
//! periodic sweep prunes stopped watches and retries contended locks.
//!
//! ## Multi-Instance Coordination
//!
//! Any number of dispatcher instances may run against the same stores. The
//! rule lock (see [`crate::rule_store`]) guarantees at most one instance
//! watches a given rule; everything else is per-instance state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use ulid::Ulid;

use trellis_core::Backoff;
use trellis_core::document::{ChangeEvent, DocumentStore, OperationType, WatchSpec};
use trellis_core::id::RuleId;
use trellis_core::tenancy::{StoreProvider, TenantStoreHandle, TenantStorePool};

use crate::config::DispatcherConfig;
use crate::error::Result;
use crate::metrics::DispatchMetrics;
use crate::queue::JobQueue;
use crate::rule::ListenerRule;
use crate::rule_store::{LockAttempt, RULES_COLLECTION, RuleStore};
use crate::supervisor::{WatchContext, run_rule_watch};

/// A running rule subscription.
struct ActiveWatch {
    rule_name: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    /// Keeps the tenant partition's pooled connection referenced while the
    /// watch lives.
    _partition: Option<TenantStoreHandle>,
}

struct Inner {
    watches: Mutex<HashMap<RuleId, ActiveWatch>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Event-driven dispatcher converting document changes into background jobs.
///
/// Cheap to clone; clones share the same registry and background tasks.
#[derive(Clone)]
pub struct ChangeDispatcher {
    shared: Arc<dyn DocumentStore>,
    rules: RuleStore,
    pool: TenantStorePool,
    queue: Arc<dyn JobQueue>,
    config: DispatcherConfig,
    instance_id: String,
    metrics: DispatchMetrics,
    inner: Arc<Inner>,
}

impl ChangeDispatcher {
    /// Creates a dispatcher over the shared store and tenant provider.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the interval relationships are
    /// invalid.
    pub fn new(
        shared: Arc<dyn DocumentStore>,
        provider: Arc<dyn StoreProvider>,
        queue: Arc<dyn JobQueue>,
        config: DispatcherConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            rules: RuleStore::new(Arc::clone(&shared)),
            shared,
            pool: TenantStorePool::new(provider),
            queue,
            config,
            instance_id: Ulid::new().to_string(),
            metrics: DispatchMetrics::new(),
            inner: Arc::new(Inner {
                watches: Mutex::new(HashMap::new()),
                background: Mutex::new(Vec::new()),
                shutdown_tx,
            }),
        })
    }

    /// This instance's unique identifier, used as the lock owner id.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The typed rule store this dispatcher reads from.
    #[must_use]
    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    /// Ensures the rule collection holds at least the given seed rules
    /// (create-if-absent per well-known name) and returns the number of
    /// active rules.
    ///
    /// # Errors
    ///
    /// Fails only if the rule store itself is unreachable; callers should
    /// treat that as fatal.
    pub async fn initialize(&self, seeds: &[ListenerRule]) -> Result<usize> {
        let active = self.rules.seed_defaults(seeds).await?;
        tracing::info!(active_rules = active, "rule store initialized");
        Ok(active)
    }

    /// Starts a watch for every active rule this instance can lock, then
    /// starts the meta-subscription and the reacquire sweep.
    ///
    /// Call once per dispatcher instance.
    pub async fn start_all(&self) -> Result<()> {
        for rule in self.rules.active_rules().await? {
            self.start_rule(rule).await?;
        }

        let meta = tokio::spawn(run_meta_watch(
            self.clone(),
            self.inner.shutdown_tx.subscribe(),
        ));
        let sweep = tokio::spawn(run_reacquire_sweep(
            self.clone(),
            self.inner.shutdown_tx.subscribe(),
        ));
        let mut background = self.inner.background.lock().await;
        background.push(meta);
        background.push(sweep);
        drop(background);

        tracing::info!(instance = %self.instance_id, "dispatcher started");
        Ok(())
    }

    /// Starts a single rule's subscription without disturbing others.
    ///
    /// Returns false (without error) when the rule is inactive, already
    /// running here, or locked by a peer.
    pub async fn start_rule(&self, rule: ListenerRule) -> Result<bool> {
        if !rule.is_active {
            return Ok(false);
        }

        let mut watches = self.inner.watches.lock().await;
        if watches.contains_key(&rule.id) {
            return Ok(false);
        }

        match self
            .rules
            .try_acquire(rule.id, &self.instance_id, self.config.lock_timeout)
            .await?
        {
            LockAttempt::Held { owner } => {
                tracing::debug!(rule = %rule.name, owner = ?owner, "rule locked by peer");
                self.metrics.record_lock_transition(&rule.name, "contended");
                Ok(false)
            }
            LockAttempt::Acquired => {
                self.metrics.record_lock_transition(&rule.name, "acquired");

                // Re-read so the watch starts from the latest persisted
                // resume token, not the caller's possibly stale copy.
                let rule = self.rules.get(rule.id).await?.unwrap_or(rule);

                let (partition, store) = match &rule.tenant_id {
                    Some(tenant) => {
                        let handle = self.pool.checkout(tenant).await?;
                        let store = handle.store();
                        (Some(handle), store)
                    }
                    None => (None, Arc::clone(&self.shared)),
                };

                let (stop_tx, stop_rx) = watch::channel(false);
                let context = WatchContext {
                    rule: rule.clone(),
                    store,
                    rules: self.rules.clone(),
                    queue: Arc::clone(&self.queue),
                    config: self.config.clone(),
                    instance_id: self.instance_id.clone(),
                    metrics: self.metrics,
                    stop: stop_rx,
                };
                let task = tokio::spawn(run_rule_watch(context));

                watches.insert(
                    rule.id,
                    ActiveWatch {
                        rule_name: rule.name.clone(),
                        stop_tx,
                        task,
                        _partition: partition,
                    },
                );
                self.metrics.set_active_watches(watches.len());
                drop(watches);

                tracing::info!(rule = %rule.name, "watch started");
                Ok(true)
            }
        }
    }

    /// Dynamically starts a subscription for a newly created rule.
    pub async fn add_rule(&self, rule: ListenerRule) -> Result<bool> {
        self.start_rule(rule).await
    }

    /// Stops a rule's subscription and releases its lock so another instance
    /// can take over immediately.
    ///
    /// Returns false if this instance wasn't watching the rule.
    pub async fn remove_rule(&self, id: RuleId) -> Result<bool> {
        let removed = self.inner.watches.lock().await.remove(&id);
        let Some(active) = removed else {
            return Ok(false);
        };

        let _ = active.stop_tx.send(true);
        if let Err(err) = active.task.await {
            tracing::warn!(rule = %active.rule_name, error = %err, "watch task ended abnormally");
        }

        // Conditional: a fenced watch no longer owns the lock, and release
        // must not clobber the new owner.
        match self.rules.release(id, &self.instance_id).await {
            Ok(true) => self.metrics.record_lock_transition(&active.rule_name, "released"),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(rule = %active.rule_name, error = %err, "lock release failed");
            }
        }

        let watches = self.inner.watches.lock().await;
        self.metrics.set_active_watches(watches.len());
        drop(watches);

        tracing::info!(rule = %active.rule_name, "watch stopped");
        Ok(true)
    }

    /// Stops every subscription and background task, releasing all held
    /// locks for fast peer takeover.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.inner.shutdown_tx.send(true);

        let mut background = self.inner.background.lock().await;
        for task in background.drain(..) {
            let _ = task.await;
        }
        drop(background);

        let ids: Vec<RuleId> = self.inner.watches.lock().await.keys().copied().collect();
        for id in ids {
            self.remove_rule(id).await?;
        }

        tracing::info!(instance = %self.instance_id, "dispatcher stopped");
        Ok(())
    }

    /// Number of subscriptions currently running on this instance.
    pub async fn active_watch_count(&self) -> usize {
        self.inner.watches.lock().await.len()
    }

    /// Number of tenant partitions currently held open by rule watches.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool lock is poisoned.
    pub fn open_partitions(&self) -> Result<usize> {
        Ok(self.pool.active_partitions()?)
    }

    /// One pass of the reacquire sweep: prunes watches whose tasks have
    /// stopped (fenced or crashed), stops watches whose rules are no longer
    /// active, and retries every active rule this instance isn't watching.
    pub async fn sweep_once(&self) -> Result<()> {
        {
            let mut watches = self.inner.watches.lock().await;
            let finished: Vec<RuleId> = watches
                .iter()
                .filter(|(_, active)| active.task.is_finished())
                .map(|(id, _)| *id)
                .collect();
            for id in finished {
                if let Some(active) = watches.remove(&id) {
                    tracing::info!(rule = %active.rule_name, "pruned stopped watch");
                }
            }
            self.metrics.set_active_watches(watches.len());
        }

        let active = self.rules.active_rules().await?;

        // The meta-subscription normally stops deactivated rules; the sweep
        // covers rules deactivated while it was reconnecting.
        let active_ids: HashSet<RuleId> = active.iter().map(|rule| rule.id).collect();
        let watched: Vec<RuleId> = self.inner.watches.lock().await.keys().copied().collect();
        for id in watched {
            if !active_ids.contains(&id) {
                self.remove_rule(id).await?;
            }
        }

        for rule in active {
            self.start_rule(rule).await?;
        }
        Ok(())
    }

    /// Applies one rule-collection change event to the local registry.
    async fn apply_rule_change(&self, event: ChangeEvent) -> Result<()> {
        match event.operation {
            OperationType::Insert | OperationType::Update => {
                let Some(doc) = event.document else {
                    return Ok(());
                };
                let rule: ListenerRule = doc.decode()?;
                if rule.is_active {
                    // No-op when already running or locked by the writer.
                    self.start_rule(rule).await?;
                } else {
                    self.remove_rule(rule.id).await?;
                }
            }
            OperationType::Delete => {
                if let Ok(id) = event.document_id.parse::<RuleId>() {
                    self.remove_rule(id).await?;
                }
            }
        }
        Ok(())
    }
}

/// Watches the rule collection itself so configuration changes apply without
/// a process restart.
async fn run_meta_watch(dispatcher: ChangeDispatcher, mut stop: watch::Receiver<bool>) {
    let mut backoff = Backoff::new(
        dispatcher.config.backoff_base,
        dispatcher.config.backoff_cap,
    );
    'outer: loop {
        if *stop.borrow() {
            break;
        }

        let mut subscription = match dispatcher.shared.watch(WatchSpec::new(RULES_COLLECTION)).await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::warn!(error = %err, "failed to open rule meta-subscription");
                let delay = backoff.next();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = stop.changed() => break 'outer,
                }
            }
        };

        loop {
            tokio::select! {
                _ = stop.changed() => break 'outer,
                event = subscription.next() => {
                    match event {
                        Some(Ok(event)) => {
                            backoff.reset();
                            if let Err(err) = dispatcher.apply_rule_change(event).await {
                                tracing::warn!(error = %err, "failed to apply rule change");
                            }
                        }
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "rule meta-subscription error");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        drop(subscription);
        let delay = backoff.next();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => break 'outer,
        }
    }
}

/// Periodically prunes stopped watches and retries contended rules.
async fn run_reacquire_sweep(dispatcher: ChangeDispatcher, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(dispatcher.config.reacquire_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }
        if let Err(err) = dispatcher.sweep_once().await {
            tracing::warn!(error = %err, "reacquire sweep failed");
        }
    }
}
