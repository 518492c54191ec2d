//! Tracing infrastructure.
//!
//! Structured, async-aware logging built on `tracing` and
//! `tracing-subscriber`:
//! - structured events with spans across the acquisition/analysis tasks
//! - environment-based filtering (`RUST_LOG` overrides the config level)
//! - pretty, compact or JSON output formats selected from configuration

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::Settings;
use crate::error::{IsiError, IsiResult};

/// Output format for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development).
    Pretty,
    /// Compact format without colors (for production).
    Compact,
    /// JSON format for structured log aggregation.
    Json,
}

/// Parse a log level string into a tracing `Level`.
pub fn parse_log_level(level: &str) -> IsiResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(IsiError::Configuration(format!(
            "invalid log level '{other}'"
        ))),
    }
}

/// Parse a format string into an `OutputFormat`.
pub fn parse_format(format: &str) -> IsiResult<OutputFormat> {
    match format.to_lowercase().as_str() {
        "pretty" => Ok(OutputFormat::Pretty),
        "compact" => Ok(OutputFormat::Compact),
        "json" => Ok(OutputFormat::Json),
        other => Err(IsiError::Configuration(format!(
            "invalid log format '{other}'"
        ))),
    }
}

/// Initialize the global tracing subscriber from configuration.
///
/// `RUST_LOG`, when set, takes precedence over the configured level. Safe to
/// call once per process; a second call returns an error from the subscriber
/// registry which is surfaced as a configuration error.
pub fn init_from_config(settings: &Settings) -> IsiResult<()> {
    let level = parse_log_level(&settings.application.log_level)?;
    let format = parse_format(&settings.application.log_format)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}", level).to_lowercase()));

    let fmt_layer = match format {
        OutputFormat::Pretty => fmt::layer()
            .with_span_events(FmtSpan::CLOSE)
            .with_thread_names(true)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_thread_names(true)
            .boxed(),
        OutputFormat::Json => fmt::layer().json().with_thread_names(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| IsiError::Configuration(format!("tracing init failed: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels() {
        assert_eq!(parse_log_level("info").ok(), Some(Level::INFO));
        assert_eq!(parse_log_level("TRACE").ok(), Some(Level::TRACE));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn parses_known_formats() {
        assert_eq!(parse_format("json").ok(), Some(OutputFormat::Json));
        assert!(parse_format("xml").is_err());
    }
}
