//! Trellis development runtime.
//!
//! Wires the change dispatcher, job runner, and batch handlers over
//! in-memory backends: a single-process harness for local development and
//! demos. Production deployments wire the same library surface over real
//! store, queue, and provider backends.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;

use trellis_batch::handlers::{self, POLL_JOB};
use trellis_batch::provider::direct::DirectUploadAdapter;
use trellis_batch::provider::memory::{InMemoryBatchJobApi, InMemoryDirectApi};
use trellis_batch::provider::object_store::ObjectStoreAdapter;
use trellis_batch::{
    AdapterRegistry, BatchLifecycle, BatchStores, LifecycleConfig, NotificationReconciler,
    NotificationStore, ProviderRouting,
};
use trellis_core::observability::{LogFormat, init_logging};
use trellis_core::tenancy::MemoryStoreProvider;
use trellis_core::{MemoryDocumentStore, MemoryObjectStore};
use trellis_dispatch::queue::runner::JobRunner;
use trellis_dispatch::queue::JobPayload;
use trellis_dispatch::{ChangeDispatcher, DispatcherConfig, JobQueue, MemoryJobQueue};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "trellisd", about = "Trellis orchestration development runtime")]
struct Args {
    /// Log output format.
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormatArg,

    /// Seconds between open-batch poll sweeps.
    #[arg(long, default_value_t = 60)]
    poll_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(match args.log_format {
        LogFormatArg::Pretty => LogFormat::Pretty,
        LogFormatArg::Json => LogFormat::Json,
    });

    let shared = Arc::new(MemoryDocumentStore::new());
    let provider = Arc::new(MemoryStoreProvider::new());
    let queue = Arc::new(MemoryJobQueue::new("trellis"));
    let config = DispatcherConfig::default();

    let dispatcher = ChangeDispatcher::new(
        shared.clone(),
        provider.clone(),
        queue.clone(),
        config.clone(),
    )?;

    let adapters = AdapterRegistry::new(ProviderRouting::default())
        .with_adapter(Arc::new(DirectUploadAdapter::new(
            Arc::new(InMemoryDirectApi::new()),
            "/v1/chat/completions",
        )))
        .with_adapter(Arc::new(ObjectStoreAdapter::new(
            Arc::new(InMemoryBatchJobApi::new()),
            Arc::new(MemoryObjectStore::new()),
            "batches",
        )));
    let lifecycle = BatchLifecycle::new(
        adapters,
        BatchStores::new(provider),
        LifecycleConfig::default(),
    );
    let notifications = NotificationStore::new(shared);
    let reconciler = NotificationReconciler::new(lifecycle.clone(), notifications.clone());

    let mut runner = JobRunner::new(config.max_job_attempts);
    handlers::register_handlers(&mut runner, &lifecycle, &reconciler, &notifications);

    let active = dispatcher.initialize(&handlers::default_rule_seeds()).await?;
    tracing::info!(active_rules = active, "initialized");
    dispatcher.start_all().await?;

    queue
        .schedule_recurring(
            JobPayload::new(POLL_JOB, None, "sweep", None),
            Duration::from_secs(args.poll_interval_secs),
        )
        .await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                queue.fire_due(Utc::now())?;
                runner.run_pending(&queue).await?;
            }
        }
    }

    tracing::info!("shutting down");
    dispatcher.shutdown().await?;
    // Drain anything enqueued during shutdown.
    runner.run_pending(&queue).await?;
    Ok(())
}
