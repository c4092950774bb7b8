//! Logging initialisation and span helpers.
//!
//! Every staging component logs through `tracing`; operators locate a
//! deposit's work by the `tld`, `mode` and `watermark` span fields.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name (`json` or `pretty`), defaulting to pretty.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `escrow_staging=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let result = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
        // Another subscriber (e.g. a test harness) may already be installed.
        let _ = result;
    });
}

/// Creates a span for work on a single deposit.
#[must_use]
pub fn deposit_span(operation: &str, tld: &str, mode: &str, watermark: &str) -> Span {
    tracing::info_span!(
        "deposit",
        op = operation,
        tld = tld,
        mode = mode,
        watermark = watermark,
    )
}

/// Creates a span for a staging job.
#[must_use]
pub fn job_span(operation: &str, job_id: &str) -> Span {
    tracing::info_span!("staging_job", op = operation, job_id = job_id)
}
