//! Observability infrastructure for sweep.
//!
//! Structured logging with consistent spans. Workers call [`init_logging`]
//! once at startup; library code only emits `tracing` events.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for unattended sweeps).
    Json,
    /// Pretty-printed logs (for interactive runs).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `sweep_dispatch=debug`)
///
/// # Example
///
/// ```rust
/// use sweep_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };
        // Another subscriber (e.g. a test harness) may already be installed.
        drop(result);
    });
}

/// Creates a span for a coordinator operation on one row.
#[must_use]
pub fn row_span(operation: &str, row_id: &str) -> Span {
    tracing::info_span!("row", op = operation, row_id = row_id)
}

/// Creates a span covering one worker process's sweep.
///
/// # Example
///
/// ```rust
/// use sweep_core::observability::worker_span;
///
/// let span = worker_span("node-1", "delimited_file");
/// let _guard = span.enter();
/// tracing::info!("sweep started");
/// ```
#[must_use]
pub fn worker_span(worker: &str, backend: &str) -> Span {
    tracing::info_span!("worker", worker = worker, backend = backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn row_span_creates_span() {
        let span = row_span("successful", "test1");
        let _guard = span.enter();
        tracing::info!("inside row span");
    }

    #[test]
    fn worker_span_creates_span() {
        let span = worker_span("node-1", "sheets");
        let _guard = span.enter();
        tracing::info!("inside worker span");
    }
}
