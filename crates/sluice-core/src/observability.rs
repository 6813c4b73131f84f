//! Observability bootstrap for Sluice services.
//!
//! Structured logging with consistent spans across the hub and its tools.
//! Services call [`init_logging`] once at startup; library code only emits
//! `tracing` events and lets the binary choose the format.

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
/// Call once at service startup. Safe to call multiple times; subsequent
/// calls are no-ops. Log levels come from `RUST_LOG` (default `info`).
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

/// Creates a span for handling one hub request.
#[must_use]
pub fn request_span(method: &str, peer: &str) -> Span {
    tracing::info_span!("request", method = method, peer = peer)
}

/// Creates a span for applying one queued mutation.
#[must_use]
pub fn mutation_span(method: &str, seq: u64) -> Span {
    tracing::info_span!("mutation", method = method, seq = seq)
}
