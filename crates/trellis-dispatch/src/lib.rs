//! # trellis-dispatch
//!
//! The event-driven half of the Trellis orchestration engine.
//!
//! This crate implements:
//!
//! - **Listener rules**: persisted configuration describing which collections
//!   and predicates should trigger which background job
//! - **Lock/heartbeat ownership**: a single atomic conditional update plus a
//!   renewal timer gives each rule at most one live watcher across
//!   horizontally scaled instances
//! - **Job queue**: a narrow at-least-once work queue abstraction with an
//!   in-memory implementation and an execution runner
//! - **Change dispatcher**: one supervised, resumable change subscription per
//!   owned rule, converting matching events into job submissions
//!
//! ## Guarantees
//!
//! - **Mutual exclusion**: for any active rule, at most one instance holds a
//!   non-expired lock at any observed instant
//! - **At-least-once dispatch**: resume tokens are persisted after enqueue,
//!   so a restart may re-deliver the last event but never skips one
//! - **Isolation**: one rule's subscription failure never affects another's

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod rule;
pub mod rule_store;

mod supervisor;

pub use config::DispatcherConfig;
pub use dispatcher::ChangeDispatcher;
pub use error::{Error, Result};
pub use queue::memory::MemoryJobQueue;
pub use queue::runner::{JobHandler, JobRunner, RunStats};
pub use queue::{EnqueueOutcome, JobPayload, JobQueue};
pub use rule::{ListenerRule, RuleLock};
pub use rule_store::{LockAttempt, RenewOutcome, RuleStore, RULES_COLLECTION};
