//! Integration tests for the change dispatcher's distributed behavior:
//! mutual exclusion, at-least-once dispatch, resume-token continuation,
//! dynamic rule changes, fencing, and shutdown handover.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use trellis_core::document::{
    Condition, Document, DocumentStore, FieldUpdate, OperationSet,
};
use trellis_core::tenancy::MemoryStoreProvider;
use trellis_core::{MemoryDocumentStore, TenantId};
use trellis_dispatch::queue::JobQueue;
use trellis_dispatch::{
    ChangeDispatcher, DispatcherConfig, ListenerRule, MemoryJobQueue, RuleStore,
    RULES_COLLECTION,
};

fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        lock_timeout: Duration::from_millis(400),
        heartbeat_interval: Duration::from_millis(100),
        reacquire_interval: Duration::from_millis(150),
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(50),
        max_job_attempts: 3,
    }
}

struct Harness {
    shared: Arc<MemoryDocumentStore>,
    queue: Arc<MemoryJobQueue>,
}

impl Harness {
    fn new() -> Self {
        Self {
            shared: Arc::new(MemoryDocumentStore::new()),
            queue: Arc::new(MemoryJobQueue::new("test")),
        }
    }

    fn dispatcher(&self) -> ChangeDispatcher {
        ChangeDispatcher::new(
            self.shared.clone(),
            Arc::new(MemoryStoreProvider::new()),
            self.queue.clone(),
            fast_config(),
        )
        .expect("valid config")
    }

    fn order_rule() -> ListenerRule {
        ListenerRule::new("order-created", "orders", "process-order")
            .with_operations(OperationSet::INSERTS)
            .with_predicate(Condition::equals("status", "new"))
    }

    async fn insert_order(&self, id: &str, status: &str) {
        let body = json!({"id": id, "status": status});
        let doc = Document::new(id.to_string(), body.as_object().cloned().unwrap());
        self.shared
            .insert("orders", doc)
            .await
            .expect("insert order");
    }
}

/// Polls a condition until it holds or two seconds elapse.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn matching_changes_become_jobs() {
    let harness = Harness::new();
    let dispatcher = harness.dispatcher();
    dispatcher
        .initialize(&[Harness::order_rule()])
        .await
        .expect("initialize");
    dispatcher.start_all().await.expect("start");
    assert_eq!(dispatcher.active_watch_count().await, 1);
    // Let the spawned watch open its subscription before producing events.
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.insert_order("o-1", "new").await;
    // Filtered out by the predicate.
    harness.insert_order("o-2", "archived").await;
    harness.insert_order("o-3", "new").await;

    let queue = harness.queue.clone();
    assert!(
        eventually(|| {
            let queue = queue.clone();
            async move { queue.queue_depth().await.unwrap() >= 2 }
        })
        .await
    );

    let first = harness.queue.take().unwrap().expect("job queued");
    assert_eq!(first.payload.job_name, "process-order");
    assert_eq!(first.payload.document_id, "o-1");
    assert!(first.payload.tenant_id.is_none());
    let document = first.payload.document.expect("post-image attached");
    assert_eq!(document.field("status"), Some(&json!("new")));

    let second = harness.queue.take().unwrap().expect("job queued");
    assert_eq!(second.payload.document_id, "o-3");
    assert_eq!(harness.queue.queue_depth().await.unwrap(), 0);

    dispatcher.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn only_one_instance_watches_a_rule() {
    let harness = Harness::new();
    let first = harness.dispatcher();
    let second = harness.dispatcher();

    first
        .initialize(&[Harness::order_rule()])
        .await
        .expect("initialize");
    first.start_all().await.expect("start first");
    second.start_all().await.expect("start second");

    assert_eq!(first.active_watch_count().await, 1);
    assert_eq!(second.active_watch_count().await, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // One event, one job, despite two running instances.
    harness.insert_order("o-1", "new").await;
    let queue = harness.queue.clone();
    assert!(
        eventually(|| {
            let queue = queue.clone();
            async move { queue.queue_depth().await.unwrap() == 1 }
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.queue.queue_depth().await.unwrap(), 1);

    first.shutdown().await.expect("shutdown first");

    // The released lock lets the standby take over without waiting out the
    // lock timeout.
    second.sweep_once().await.expect("sweep");
    assert_eq!(second.active_watch_count().await, 1);
    second.shutdown().await.expect("shutdown second");
}

#[tokio::test]
async fn restart_resumes_from_persisted_token() {
    let harness = Harness::new();
    let rule = Harness::order_rule();

    let first = harness.dispatcher();
    first.initialize(&[rule]).await.expect("initialize");
    first.start_all().await.expect("start");
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.insert_order("o-1", "new").await;
    let queue = harness.queue.clone();
    assert!(
        eventually(|| {
            let queue = queue.clone();
            async move { queue.queue_depth().await.unwrap() == 1 }
        })
        .await
    );
    let job = harness.queue.take().unwrap().expect("first job");
    assert_eq!(job.payload.document_id, "o-1");
    first.shutdown().await.expect("shutdown");

    // A change lands while nothing is watching.
    harness.insert_order("o-2", "new").await;

    let second = harness.dispatcher();
    second.start_all().await.expect("restart");
    let queue = harness.queue.clone();
    assert!(
        eventually(|| {
            let queue = queue.clone();
            async move { queue.queue_depth().await.unwrap() == 1 }
        })
        .await
    );

    // Only the unseen event is dispatched; o-1 is not replayed.
    let job = harness.queue.take().unwrap().expect("resumed job");
    assert_eq!(job.payload.document_id, "o-2");
    assert_eq!(harness.queue.queue_depth().await.unwrap(), 0);
    second.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn rule_collection_changes_apply_without_restart() {
    let harness = Harness::new();
    let dispatcher = harness.dispatcher();
    dispatcher.initialize(&[]).await.expect("initialize");
    dispatcher.start_all().await.expect("start");
    assert_eq!(dispatcher.active_watch_count().await, 0);

    // Inserting a rule document starts its subscription.
    let rules = RuleStore::new(harness.shared.clone());
    let rule = Harness::order_rule();
    rules.insert(&rule).await.expect("insert rule");

    let d = dispatcher.clone();
    assert!(
        eventually(|| {
            let d = d.clone();
            async move { d.active_watch_count().await == 1 }
        })
        .await
    );

    // Soft-disabling it stops the subscription and releases the lock.
    rules.deactivate(rule.id).await.expect("deactivate");
    let d = dispatcher.clone();
    assert!(
        eventually(|| {
            let d = d.clone();
            async move { d.active_watch_count().await == 0 }
        })
        .await
    );
    let current = rules.get(rule.id).await.expect("get").expect("rule kept");
    assert!(current.lock.is_none());
    assert!(!current.is_active);

    dispatcher.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn stolen_lock_fences_the_old_watcher() {
    let harness = Harness::new();
    let dispatcher = harness.dispatcher();
    let rule = Harness::order_rule();
    dispatcher.initialize(&[rule.clone()]).await.expect("initialize");
    dispatcher.start_all().await.expect("start");
    assert_eq!(dispatcher.active_watch_count().await, 1);

    // Simulate a peer stealing the lock after a missed heartbeat. The
    // intruder's heartbeat is kept far in the future so this instance cannot
    // legitimately re-acquire during the test.
    let far_future = chrono::Utc::now() + chrono::Duration::hours(1);
    harness
        .shared
        .update_if(
            RULES_COLLECTION,
            &rule.id.to_string(),
            &Condition::True,
            &[
                FieldUpdate::set("lock.ownerId", "intruder"),
                FieldUpdate::Set(
                    "lock.lastHeartbeat".to_string(),
                    serde_json::to_value(far_future).unwrap(),
                ),
            ],
        )
        .await
        .expect("steal lock");

    // The next renewal observes the theft and the watch stands down within a
    // heartbeat interval; the sweep then prunes the stopped task.
    let d = dispatcher.clone();
    assert!(
        eventually(|| {
            let d = d.clone();
            async move {
                d.sweep_once().await.expect("sweep");
                d.active_watch_count().await == 0
            }
        })
        .await
    );

    // The fenced instance no longer dispatches for the rule.
    while harness.queue.take().unwrap().is_some() {}
    harness.insert_order("o-9", "new").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.queue.queue_depth().await.unwrap(), 0);

    dispatcher.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn shutdown_releases_every_lock() {
    let harness = Harness::new();
    let dispatcher = harness.dispatcher();
    let rule = Harness::order_rule();
    dispatcher.initialize(&[rule.clone()]).await.expect("initialize");
    dispatcher.start_all().await.expect("start");

    let rules = RuleStore::new(harness.shared.clone());
    let held = rules.get(rule.id).await.expect("get").expect("rule");
    assert!(held.lock.is_some());

    dispatcher.shutdown().await.expect("shutdown");
    assert_eq!(dispatcher.active_watch_count().await, 0);

    let released = rules.get(rule.id).await.expect("get").expect("rule");
    assert!(released.lock.is_none());
}

#[tokio::test]
async fn tenant_rules_share_a_pooled_partition() {
    let harness = Harness::new();
    let provider = Arc::new(MemoryStoreProvider::new());
    let dispatcher = ChangeDispatcher::new(
        harness.shared.clone(),
        provider.clone(),
        harness.queue.clone(),
        fast_config(),
    )
    .expect("valid config");

    let tenant = TenantId::new("acme").expect("valid tenant id");
    let batches_rule = ListenerRule::new("batch-written", "batches", "chain-batch")
        .with_tenant(tenant.clone());
    let audit_rule = ListenerRule::new("audit-written", "audit", "chain-audit")
        .with_tenant(tenant.clone());
    dispatcher.rules().insert(&batches_rule).await.expect("insert rule");
    dispatcher.rules().insert(&audit_rule).await.expect("insert rule");

    assert!(dispatcher.add_rule(batches_rule.clone()).await.expect("add"));
    assert!(dispatcher.add_rule(audit_rule.clone()).await.expect("add"));
    // Two rules, one reference-counted partition connection.
    assert_eq!(dispatcher.open_partitions().expect("count"), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Events in the tenant partition dispatch with the tenant attached.
    let partition = provider.register(&tenant).expect("partition");
    let body = json!({"id": "b-1", "status": "received"});
    partition
        .insert(
            "batches",
            Document::new("b-1".to_string(), body.as_object().cloned().unwrap()),
        )
        .await
        .expect("insert batch");
    let queue = harness.queue.clone();
    assert!(
        eventually(|| {
            let queue = queue.clone();
            async move { queue.queue_depth().await.unwrap() == 1 }
        })
        .await
    );
    let job = harness.queue.take().unwrap().expect("job queued");
    assert_eq!(job.payload.job_name, "chain-batch");
    assert_eq!(job.payload.tenant_id, Some(tenant.clone()));

    // The partition stays open until the last referencing rule stops.
    dispatcher.remove_rule(batches_rule.id).await.expect("remove");
    assert_eq!(dispatcher.open_partitions().expect("count"), 1);
    dispatcher.remove_rule(audit_rule.id).await.expect("remove");
    assert_eq!(dispatcher.open_partitions().expect("count"), 0);
}
