//! End-to-end tests for the batch lifecycle: submission, status polling,
//! notification reconciliation through the dispatch loop, idempotent
//! redelivery, and orphan handling.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use trellis_batch::handlers::{self, BatchPollHandler, POLL_JOB};
use trellis_batch::provider::direct::DirectUploadAdapter;
use trellis_batch::provider::memory::{InMemoryBatchJobApi, InMemoryDirectApi};
use trellis_batch::provider::object_store::ObjectStoreAdapter;
use trellis_batch::{
    AdapterRegistry, BatchLifecycle, BatchStatus, BatchStores, InferenceRequest, LifecycleConfig,
    Message, NotificationReconciler, NotificationRecord, NotificationStore, ProviderKind,
    ProviderRouting, ReconcileOutcome,
};
use trellis_core::object_store::ObjectStore;
use trellis_core::tenancy::MemoryStoreProvider;
use trellis_core::{MemoryDocumentStore, MemoryObjectStore, TenantId};
use trellis_dispatch::queue::runner::{JobHandler, JobRunner};
use trellis_dispatch::queue::JobPayload;
use trellis_dispatch::{ChangeDispatcher, DispatcherConfig, MemoryJobQueue};

struct Stack {
    shared: Arc<MemoryDocumentStore>,
    provider: Arc<MemoryStoreProvider>,
    objects: Arc<MemoryObjectStore>,
    direct_api: Arc<InMemoryDirectApi>,
    job_api: Arc<InMemoryBatchJobApi>,
    lifecycle: BatchLifecycle,
    notifications: NotificationStore,
    reconciler: NotificationReconciler,
}

impl Stack {
    fn new() -> Self {
        let shared = Arc::new(MemoryDocumentStore::new());
        let provider = Arc::new(MemoryStoreProvider::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let direct_api = Arc::new(InMemoryDirectApi::new());
        let job_api = Arc::new(InMemoryBatchJobApi::new());

        let adapters = AdapterRegistry::new(ProviderRouting::default())
            .with_adapter(Arc::new(DirectUploadAdapter::new(
                direct_api.clone(),
                "/v1/chat/completions",
            )))
            .with_adapter(Arc::new(ObjectStoreAdapter::new(
                job_api.clone(),
                objects.clone(),
                "batches",
            )));
        let lifecycle = BatchLifecycle::new(
            adapters,
            BatchStores::new(provider.clone()),
            LifecycleConfig::default(),
        );
        let notifications = NotificationStore::new(shared.clone());
        let reconciler = NotificationReconciler::new(lifecycle.clone(), notifications.clone());

        Self {
            shared,
            provider,
            objects,
            direct_api,
            job_api,
            lifecycle,
            notifications,
            reconciler,
        }
    }
}

fn tenant() -> TenantId {
    TenantId::new("tenant1").expect("valid tenant id")
}

fn mediated_requests() -> Vec<InferenceRequest> {
    vec![
        InferenceRequest::new(
            "r1",
            "gemini-2.0-flash",
            vec![Message::system("be terse"), Message::user("one")],
        ),
        InferenceRequest::new("r2", "gemini-2.0-flash", vec![Message::user("two")]),
    ]
}

fn direct_requests() -> Vec<InferenceRequest> {
    vec![
        InferenceRequest::new("r1", "gpt-4o-mini", vec![Message::user("one")]),
        InferenceRequest::new("r2", "gpt-4o-mini", vec![Message::user("two")]),
    ]
}

#[tokio::test]
async fn submission_creates_a_submitted_record() {
    let stack = Stack::new();
    let receipt = stack
        .lifecycle
        .submit(&mediated_requests(), &tenant())
        .await
        .expect("submit");
    assert!(!receipt.provider_batch_id.is_empty());
    assert_eq!(receipt.request_count, 2);

    let store = stack
        .lifecycle
        .stores()
        .for_tenant(&tenant())
        .await
        .expect("open store");
    let record = store.get(receipt.batch_id).await.expect("get").expect("record");
    assert_eq!(record.status, BatchStatus::Submitted);
    assert_eq!(record.request_count, 2);
    assert_eq!(record.provider, ProviderKind::ObjectStoreMediated);
    // The output prefix embeds the batch id, making location matching
    // unambiguous.
    let output = record.output_location.expect("output location known");
    assert!(output.contains(&receipt.batch_id.to_string()));
    assert!(!record.is_processed);
}

#[tokio::test]
async fn in_progress_status_does_not_advance_the_record() {
    let stack = Stack::new();
    let receipt = stack
        .lifecycle
        .submit(&direct_requests(), &tenant())
        .await
        .expect("submit");

    // The provider job is still running; a poll sweep must not move the
    // record.
    let poll = BatchPollHandler::new(stack.lifecycle.clone());
    poll.run(&JobPayload::new(POLL_JOB, None, "sweep", None))
        .await
        .expect("sweep");

    let store = stack
        .lifecycle
        .stores()
        .for_tenant(&tenant())
        .await
        .expect("open store");
    let record = store.get(receipt.batch_id).await.expect("get").expect("record");
    assert_eq!(record.status, BatchStatus::Submitted);
    assert!(record.results.is_empty());
    assert_eq!(stack.direct_api.download_calls(), 0);
}

#[tokio::test]
async fn notification_drives_batch_to_received_through_dispatch_loop() {
    let stack = Stack::new();
    let queue = Arc::new(MemoryJobQueue::new("test"));
    let dispatcher = ChangeDispatcher::new(
        stack.shared.clone(),
        stack.provider.clone(),
        queue.clone(),
        DispatcherConfig {
            lock_timeout: Duration::from_millis(400),
            heartbeat_interval: Duration::from_millis(100),
            reacquire_interval: Duration::from_millis(150),
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(50),
            max_job_attempts: 3,
        },
    )
    .expect("dispatcher");
    dispatcher
        .initialize(&handlers::default_rule_seeds())
        .await
        .expect("initialize");
    dispatcher.start_all().await.expect("start");
    // Let the spawned watch open its subscription before producing events.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut runner = JobRunner::new(3);
    handlers::register_handlers(
        &mut runner,
        &stack.lifecycle,
        &stack.reconciler,
        &stack.notifications,
    );

    let receipt = stack
        .lifecycle
        .submit(&mediated_requests(), &tenant())
        .await
        .expect("submit");
    let store = stack
        .lifecycle
        .stores()
        .for_tenant(&tenant())
        .await
        .expect("open store");
    let record = store.get(receipt.batch_id).await.expect("get").expect("record");
    let output_prefix = record.output_location.clone().expect("output location");

    // The provider finishes: results land under the output prefix (out of
    // correlation order) and the job succeeds.
    let fragment = format!(
        "{}\n{}",
        json!({"customId": "r2", "response": {"text": "two"}}),
        json!({"customId": "r1", "response": {"text": "one"}}),
    );
    stack
        .objects
        .put(
            &format!("{output_prefix}fragment-0001.jsonl"),
            Bytes::from(fragment),
        )
        .await
        .expect("write fragment");
    stack
        .job_api
        .succeed_job(&receipt.provider_batch_id)
        .expect("succeed job");

    // The webhook ingester records the completion signal; the dispatcher
    // turns it into a reconciliation job.
    let notification = NotificationRecord::new(
        ProviderKind::ObjectStoreMediated,
        output_prefix.clone(),
    );
    stack
        .notifications
        .create(&notification)
        .await
        .expect("create notification");

    let mut processed = false;
    for _ in 0..100 {
        runner.run_pending(&queue).await.expect("run jobs");
        let current = stack
            .notifications
            .get(notification.id)
            .await
            .expect("get notification")
            .expect("notification");
        if current.processed {
            processed = true;
            assert_eq!(current.matched_batch_id, Some(receipt.batch_id));
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(processed, "notification never processed");

    let record = store.get(receipt.batch_id).await.expect("get").expect("record");
    assert_eq!(record.status, BatchStatus::Received);
    assert_eq!(record.results.len(), 2);
    // Results are stored in correlation-id order regardless of fragment
    // order.
    assert_eq!(record.results[0]["customId"], "r1");
    assert_eq!(record.results[1]["customId"], "r2");
    assert!(record.completed_at.is_some());

    // Input and output artifacts are deleted to bound storage cost.
    assert!(stack.objects.is_empty().expect("object count"));

    dispatcher.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn duplicate_notification_delivery_downloads_once() {
    let stack = Stack::new();
    let receipt = stack
        .lifecycle
        .submit(&direct_requests(), &tenant())
        .await
        .expect("submit");
    stack
        .direct_api
        .complete_batch(
            &receipt.provider_batch_id,
            &[
                json!({"customId": "r1", "response": {"text": "one"}}),
                json!({"customId": "r2", "response": {"text": "two"}}),
            ],
        )
        .expect("complete batch");

    let notification =
        NotificationRecord::new(ProviderKind::DirectUpload, receipt.provider_batch_id.clone());
    stack
        .notifications
        .create(&notification)
        .await
        .expect("create notification");

    let outcome = stack
        .reconciler
        .reconcile(&notification)
        .await
        .expect("first reconcile");
    assert_eq!(
        outcome,
        ReconcileOutcome::Stored {
            batch_id: receipt.batch_id
        }
    );
    assert_eq!(stack.direct_api.download_calls(), 1);

    // Redelivery with the stale pre-processing snapshot: the conditional
    // writes, not the caller's view, decide what has happened.
    let outcome = stack
        .reconciler
        .reconcile(&notification)
        .await
        .expect("second reconcile");
    assert_eq!(outcome, ReconcileOutcome::AlreadyProcessed);

    // Redelivery with the fresh record short-circuits on the processed flag.
    let fresh = stack
        .notifications
        .get(notification.id)
        .await
        .expect("get")
        .expect("notification");
    let outcome = stack
        .reconciler
        .reconcile(&fresh)
        .await
        .expect("third reconcile");
    assert_eq!(outcome, ReconcileOutcome::AlreadyProcessed);

    // One download, one result set.
    assert_eq!(stack.direct_api.download_calls(), 1);
    let store = stack
        .lifecycle
        .stores()
        .for_tenant(&tenant())
        .await
        .expect("open store");
    let record = store.get(receipt.batch_id).await.expect("get").expect("record");
    assert_eq!(record.status, BatchStatus::Received);
    assert_eq!(record.results.len(), 2);
}

#[tokio::test]
async fn unmatched_notification_is_marked_processed_without_error() {
    let stack = Stack::new();
    // A tenant partition exists but holds nothing matching.
    stack
        .lifecycle
        .submit(&mediated_requests(), &tenant())
        .await
        .expect("submit");

    let notification = NotificationRecord::new(
        ProviderKind::ObjectStoreMediated,
        "batches/tenant1/unknown-batch/out/",
    );
    stack
        .notifications
        .create(&notification)
        .await
        .expect("create notification");

    let outcome = stack
        .reconciler
        .reconcile(&notification)
        .await
        .expect("reconcile");
    assert_eq!(outcome, ReconcileOutcome::Unmatched);

    let current = stack
        .notifications
        .get(notification.id)
        .await
        .expect("get")
        .expect("notification");
    assert!(current.processed);
    assert!(current.processed_at.is_some());
    assert!(current.matched_batch_id.is_none());
}

#[tokio::test]
async fn notification_with_fragment_path_matches_by_prefix() {
    let stack = Stack::new();
    let receipt = stack
        .lifecycle
        .submit(&mediated_requests(), &tenant())
        .await
        .expect("submit");
    let store = stack
        .lifecycle
        .stores()
        .for_tenant(&tenant())
        .await
        .expect("open store");
    let record = store.get(receipt.batch_id).await.expect("get").expect("record");
    let output_prefix = record.output_location.expect("output location");

    stack
        .objects
        .put(
            &format!("{output_prefix}fragment-0001.jsonl"),
            Bytes::from(json!({"customId": "r1"}).to_string()),
        )
        .await
        .expect("write fragment");
    stack
        .job_api
        .succeed_job(&receipt.provider_batch_id)
        .expect("succeed job");

    // The provider notifies with a concrete object path, not the prefix.
    let notification = NotificationRecord::new(
        ProviderKind::ObjectStoreMediated,
        format!("{output_prefix}fragment-0001.jsonl"),
    );
    stack
        .notifications
        .create(&notification)
        .await
        .expect("create notification");

    let outcome = stack
        .reconciler
        .reconcile(&notification)
        .await
        .expect("reconcile");
    assert_eq!(
        outcome,
        ReconcileOutcome::Stored {
            batch_id: receipt.batch_id
        }
    );
}

#[tokio::test]
async fn poll_sweep_completes_batches_without_a_notification() {
    let stack = Stack::new();
    let receipt = stack
        .lifecycle
        .submit(&direct_requests(), &tenant())
        .await
        .expect("submit");
    stack
        .direct_api
        .complete_batch(&receipt.provider_batch_id, &[json!({"customId": "r1"})])
        .expect("complete batch");

    let poll = BatchPollHandler::new(stack.lifecycle.clone());
    poll.run(&JobPayload::new(POLL_JOB, None, "sweep", None))
        .await
        .expect("sweep");

    let store = stack
        .lifecycle
        .stores()
        .for_tenant(&tenant())
        .await
        .expect("open store");
    let record = store.get(receipt.batch_id).await.expect("get").expect("record");
    assert_eq!(record.status, BatchStatus::Received);
    assert_eq!(record.results.len(), 1);
    // Provider-side artifacts are gone.
    assert_eq!(stack.direct_api.file_count().expect("file count"), 0);
}

#[tokio::test]
async fn poll_sweep_records_provider_reported_failures() {
    let stack = Stack::new();
    let receipt = stack
        .lifecycle
        .submit(&direct_requests(), &tenant())
        .await
        .expect("submit");
    stack
        .direct_api
        .fail_batch(&receipt.provider_batch_id, "quota exceeded")
        .expect("fail batch");

    let poll = BatchPollHandler::new(stack.lifecycle.clone());
    poll.run(&JobPayload::new(POLL_JOB, None, "sweep", None))
        .await
        .expect("sweep");

    let store = stack
        .lifecycle
        .stores()
        .for_tenant(&tenant())
        .await
        .expect("open store");
    let record = store.get(receipt.batch_id).await.expect("get").expect("record");
    assert_eq!(record.status, BatchStatus::Failed);
    assert_eq!(record.failure_reason.as_deref(), Some("quota exceeded"));
}
