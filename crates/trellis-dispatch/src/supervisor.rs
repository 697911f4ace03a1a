//! Per-rule watch supervision.
//!
//! Each owned rule runs one task: it opens a change subscription from the
//! rule's persisted resume token, turns matching events into job submissions,
//! and renews the rule lock on a heartbeat timer. The task is fully isolated;
//! its failures back off and retry locally without touching other rules.
//!
//! ## Fencing
//!
//! A renewal that finds the lock no longer ours means a peer stole ownership
//! after a missed heartbeat. The task tears down immediately without
//! releasing the lock (it isn't ours to release) so at most one instance ever
//! dispatches for a rule. The dispatcher's sweep prunes the stopped task and
//! may re-acquire later.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use trellis_core::Backoff;
use trellis_core::document::{Condition, DocumentStore, ResumeToken, WatchSpec};

use crate::config::DispatcherConfig;
use crate::metrics::DispatchMetrics;
use crate::queue::{JobPayload, JobQueue};
use crate::rule::ListenerRule;
use crate::rule_store::{RenewOutcome, RuleStore};

/// Everything a rule watch task needs, moved into the task at spawn.
pub(crate) struct WatchContext {
    pub rule: ListenerRule,
    /// Store holding the rule's target collection (shared or tenant
    /// partition).
    pub store: Arc<dyn DocumentStore>,
    pub rules: RuleStore,
    pub queue: Arc<dyn JobQueue>,
    pub config: DispatcherConfig,
    pub instance_id: String,
    pub metrics: DispatchMetrics,
    pub stop: watch::Receiver<bool>,
}

/// Runs one rule's subscription until stopped or fenced.
pub(crate) async fn run_rule_watch(ctx: WatchContext) {
    let WatchContext {
        rule,
        store,
        rules,
        queue,
        config,
        instance_id,
        metrics,
        mut stop,
    } = ctx;

    let mut resume: Option<ResumeToken> = rule.resume_token.clone();
    let mut backoff = Backoff::new(config.backoff_base, config.backoff_cap);
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; renewing right after acquisition
    // is redundant.
    heartbeat.tick().await;

    'outer: loop {
        if *stop.borrow() {
            break;
        }

        let spec = WatchSpec::new(rule.target_collection.clone())
            .with_operations(rule.operations)
            .with_filter(rule.predicate.clone().unwrap_or(Condition::True))
            .resume_after(resume.clone());

        let mut subscription = match store.watch(spec).await {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::warn!(rule = %rule.name, error = %err, "failed to open subscription");
                metrics.record_subscription_error(&rule.name);
                if pause(&mut stop, &mut backoff).await {
                    break 'outer;
                }
                continue;
            }
        };
        tracing::debug!(rule = %rule.name, resume = ?resume, "subscription open");

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    break 'outer;
                }
                _ = heartbeat.tick() => {
                    match rules.renew(rule.id, &instance_id).await {
                        Ok(RenewOutcome::Renewed) => {}
                        Ok(RenewOutcome::Lost) => {
                            tracing::info!(
                                rule = %rule.name,
                                instance = %instance_id,
                                "rule lock lost to a peer, standing down"
                            );
                            metrics.record_lock_transition(&rule.name, "lost");
                            return;
                        }
                        Err(err) => {
                            // Renewal will be retried on the next tick; if the
                            // store stays unreachable long enough a peer steals
                            // the lock and the next renewal observes it.
                            tracing::warn!(rule = %rule.name, error = %err, "heartbeat renewal failed");
                        }
                    }
                }
                event = subscription.next() => {
                    match event {
                        Some(Ok(event)) => {
                            let payload = JobPayload::from_change(
                                rule.job_name.clone(),
                                rule.tenant_id.clone(),
                                &event,
                            );
                            match queue.enqueue_now(payload).await {
                                Ok(outcome) => {
                                    metrics.record_event(&rule.name, event.operation.as_label());
                                    metrics.record_enqueue(&rule.job_name, !outcome.is_enqueued());
                                    // Enqueue before token save: a crash in
                                    // between re-delivers this event, never
                                    // skips it.
                                    resume = Some(event.resume_token.clone());
                                    if let Err(err) =
                                        rules.save_resume_token(rule.id, &event.resume_token).await
                                    {
                                        tracing::warn!(
                                            rule = %rule.name,
                                            error = %err,
                                            "failed to persist resume token"
                                        );
                                    }
                                    backoff.reset();
                                }
                                Err(err) => {
                                    // Token not advanced: the event is
                                    // redelivered when the subscription
                                    // reopens.
                                    tracing::warn!(
                                        rule = %rule.name,
                                        document = %event.document_id,
                                        error = %err,
                                        "enqueue failed, reopening subscription"
                                    );
                                    metrics.record_subscription_error(&rule.name);
                                    break;
                                }
                            }
                        }
                        Some(Err(err)) => {
                            tracing::warn!(rule = %rule.name, error = %err, "subscription error");
                            metrics.record_subscription_error(&rule.name);
                            break;
                        }
                        None => {
                            tracing::warn!(rule = %rule.name, "subscription closed by store");
                            metrics.record_subscription_error(&rule.name);
                            break;
                        }
                    }
                }
            }
        }

        drop(subscription);
        if pause(&mut stop, &mut backoff).await {
            break 'outer;
        }
    }

    tracing::debug!(rule = %rule.name, "watch task stopped");
}

/// Sleeps for the next backoff delay. Returns true if a stop was requested
/// during the pause.
async fn pause(stop: &mut watch::Receiver<bool>, backoff: &mut Backoff) -> bool {
    let delay = backoff.next();
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop.changed() => true,
    }
}
