//! Observability infrastructure for Trellis.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors for consistent observability
//! across all Trellis components.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times; subsequent
/// calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `trellis_dispatch=debug`)
///
/// # Example
///
/// ```rust
/// use trellis_core::observability::{LogFormat, init_logging};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for change-dispatch operations.
///
/// # Example
///
/// ```rust
/// use trellis_core::observability::dispatch_span;
///
/// let span = dispatch_span("watch", "provider-notification-created");
/// let _guard = span.enter();
/// // ... dispatch work
/// ```
#[must_use]
pub fn dispatch_span(operation: &str, rule: &str) -> Span {
    tracing::info_span!("dispatch", op = operation, rule = rule)
}

/// Creates a span for batch lifecycle operations.
#[must_use]
pub fn batch_span(operation: &str, batch_id: &str, tenant: &str) -> Span {
    tracing::info_span!("batch", op = operation, batch = batch_id, tenant = tenant)
}
