//! Observability infrastructure for Relay.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors used across all Relay
//! components.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

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
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `relay_flow=debug`)
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

/// Creates a span for producer lifecycle operations.
#[must_use]
pub fn producer_span(operation: &str, consumer_id: &str, user: &str, project: &str) -> Span {
    tracing::info_span!(
        "producer",
        op = operation,
        consumer_id = consumer_id,
        user = user,
        project = project,
    )
}

/// Creates a span for event stream operations.
#[must_use]
pub fn stream_span(operation: &str, user: &str, project: &str) -> Span {
    tracing::info_span!("stream", op = operation, user = user, project = project)
}

/// Creates a span for sandbox sync runs.
#[must_use]
pub fn sync_span(operation: &str, work_root: &str) -> Span {
    tracing::info_span!("sync", op = operation, work_root = work_root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = producer_span("start", "producer-1", "u1", "p1");
        let _guard = span.enter();
        tracing::info!("producer span active");

        let span = sync_span("periodic", "/mnt/work/p1");
        let _guard2 = span.enter();
        tracing::info!("sync span active");
    }
}
