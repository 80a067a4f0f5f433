//! Logging utilities with structured JSON output support.
//!
//! Every rank logs through the same subscriber; collective calls tag their
//! events with `rank` so interleaved output from simulated ranks stays readable.

use tracing_subscriber::{fmt, EnvFilter};

/// Logging format options
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogFormat {
    /// Human-readable format (default)
    Pretty,
    /// JSON format for log aggregation
    Json,
    /// Compact single-line format
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Initialize logging with the default pretty format.
pub fn init_logging() {
    init_logging_with_format(LogFormat::Pretty);
}

/// Initialize logging with the specified format.
///
/// Set `RUST_LOG` to control the level. Calling this more than once is a no-op,
/// so tests that spin up several ranks may all call it.
pub fn init_logging_with_format(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format {
        LogFormat::Pretty => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true)
            .with_file(false)
            .with_line_number(false)
            .try_init(),
        LogFormat::Json => fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .flatten_event(true)
            .try_init(),
        LogFormat::Compact => fmt()
            .with_env_filter(filter)
            .compact()
            .with_target(false)
            .try_init(),
    };
    // A subscriber is already installed; keep it.
    let _ = result;
}

/// Initialize logging based on `DARRAY_LOG_FORMAT` ("json", "compact", anything
/// else selects pretty output).
pub fn init_logging_from_env() {
    let format = std::env::var("DARRAY_LOG_FORMAT")
        .map(|s| LogFormat::parse(&s))
        .unwrap_or(LogFormat::Pretty);

    init_logging_with_format(format);
}
