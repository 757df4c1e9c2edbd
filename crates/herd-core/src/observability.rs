//! Structured logging initialization.
//!
//! Components log through `tracing` with structured fields; this module
//! installs the process-wide subscriber:
//! - JSON or pretty format
//! - Level taken from `RUST_LOG` when set, otherwise from configuration

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format (for development).
    #[default]
    Pretty,
    /// JSON format (for production log aggregation).
    Json,
}

impl LogFormat {
    /// Parse log format from string.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        }
    }
}

/// Initialize the logging system.
///
/// Returns false if a global subscriber was already installed, which keeps
/// repeated initialization (tests, embedded use) harmless.
///
/// # Arguments
///
/// * `level` - Log level for the herd crates (trace, debug, info, warn, error)
/// * `format` - Output format
///
/// # Example
///
/// ```rust,no_run
/// use herd_core::observability::{init_logging, LogFormat};
///
/// init_logging("info", LogFormat::Json);
/// ```
pub fn init_logging(level: &str, format: LogFormat) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("herd={level},herd_coalesce={level},herd_batch={level},herd_pool={level}").into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()
            .is_ok(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init().is_ok(),
    };

    if installed {
        tracing::info!(level = %level, format = format.as_str(), "Logging initialized");
    }

    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("anything-else"), LogFormat::Pretty);
    }

    #[test]
    fn test_format_deserializes_lowercase() {
        let format: LogFormat = serde_json::from_str(r#""json""#).unwrap();
        assert_eq!(format, LogFormat::Json);
    }

    #[test]
    fn test_second_init_is_noop() {
        let first = init_logging("debug", LogFormat::Pretty);
        let second = init_logging("debug", LogFormat::Json);
        assert!(!second || !first);
    }
}
