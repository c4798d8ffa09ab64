//! Tracing initialization.
//!
//! Structured, async-aware logging over `tracing` / `tracing-subscriber`:
//! environment-based filtering (`RUST_LOG` wins over the configured level),
//! pretty, compact and JSON output, and idempotent initialization so tests
//! sharing a process can all call it.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::RunConfig;
use crate::error::{ProbeError, Result};

/// Output format for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty-printed with colors, for interactive use.
    Pretty,
    /// Single-line without colors, for headless runs.
    Compact,
    /// JSON for log aggregation.
    Json,
}

/// Tracing options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level used when `RUST_LOG` is not set.
    pub level: Level,
    pub format: LogFormat,
    /// Include span NEW/CLOSE events.
    pub with_span_events: bool,
    /// Include file and line numbers.
    pub with_file_and_line: bool,
    /// ANSI colors (Pretty format only).
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_span_events: false,
            with_file_and_line: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from the run configuration.
pub fn init_from_config(config: &RunConfig) -> Result<()> {
    let level = parse_log_level(&config.application.log_level)?;
    init(TracingConfig::new(level).with_format(config.application.log_format))
}

/// Initialize tracing with custom options.
///
/// Idempotent: if a global subscriber is already set, this returns Ok
/// without replacing it.
pub fn init(config: TracingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    match config.format {
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_ansi(config.with_ansi)
                .with_filter(env_filter);
            graceful(tracing_subscriber::registry().with(fmt_layer).try_init())
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_ansi(false)
                .with_filter(env_filter);
            graceful(tracing_subscriber::registry().with(fmt_layer).try_init())
        }
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_filter(env_filter);
            graceful(tracing_subscriber::registry().with(fmt_layer).try_init())
        }
    }
}

fn graceful(
    result: std::result::Result<(), tracing_subscriber::util::TryInitError>,
) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        // Expected when tests or an embedding application initialized first.
        Err(e)
            if e.to_string()
                .contains("a global default trace dispatcher has already been set") =>
        {
            Ok(())
        }
        Err(e) => Err(ProbeError::Configuration(format!(
            "Failed to initialize tracing: {e}"
        ))),
    }
}

/// Parse a log level name into a tracing [`Level`].
fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(ProbeError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_log_levels_case_insensitively() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_builder_applies_options() {
        let config = TracingConfig::new(Level::WARN)
            .with_format(LogFormat::Json)
            .with_span_events(true)
            .with_ansi(false);
        assert!(matches!(config.level, Level::WARN));
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
    }

    #[test]
    fn test_log_format_names_match_the_config_file() {
        let format: LogFormat = serde_json::from_str("\"compact\"").expect("parse");
        assert_eq!(format, LogFormat::Compact);
    }

    #[test]
    fn test_reinitialization_is_a_noop() {
        let config = TracingConfig::new(Level::INFO).with_ansi(false);
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}
