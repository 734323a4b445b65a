//! Logging infrastructure - structured tracing throughout the interop core
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels per module
//! - Zero-cost when disabled
//! - File and console output with rotation

use once_cell::sync::OnceCell;
use std::io;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

mod macros;
pub use macros::*;

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Enable file logging
    pub file_output: bool,
    /// Log file path (if file_output enabled)
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_output: false,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // RHEA_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("RHEA_LOG_LEVEL") {
            config.level = match level_str.to_lowercase().as_str() {
                "trace" => Level::TRACE,
                "debug" => Level::DEBUG,
                "info" => Level::INFO,
                "warn" => Level::WARN,
                "error" => Level::ERROR,
                _ => Level::INFO,
            };
        }

        // RHEA_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("RHEA_LOG_FILE") {
            config.file_output = true;
            config.log_path = Some(path);
        }

        // RHEA_LOG_JSON: enable JSON format
        config.json_format = std::env::var("RHEA_LOG_JSON").is_ok();

        // RHEA_LOG_SPANS: show span events
        config.show_spans = std::env::var("RHEA_LOG_SPANS").is_ok();

        config
    }
}

/// Initialize logging with default configuration
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "rhea_runtime={}",
                config.level.as_str().to_lowercase()
            ))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(io::stdout)
                    .with_span_events(span_events)
                    .with_target(true)
                    .with_thread_ids(cfg!(debug_assertions))
                    .with_line_number(cfg!(debug_assertions)),
            )
            .init();
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

/// Log a native downcall through the bridge
#[inline]
pub fn log_native_call(fn_name: &str, arg_count: usize) {
    tracing::debug!(
        event = "native_call",
        function = fn_name,
        args = arg_count,
        "Native function called"
    );
}

/// Log a native downcall return
#[inline]
pub fn log_native_return(fn_name: &str) {
    tracing::trace!(
        event = "native_return",
        function = fn_name,
        "Native function returned"
    );
}

/// Log symbol registration
#[inline]
pub fn log_symbol_registration(library: &str, count: usize) {
    tracing::debug!(
        event = "symbol_registration",
        library = library,
        symbols = count,
        "Native symbols registered"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.file_output);
    }

    #[test]
    fn test_init_idempotent() {
        init();
        init(); // Should not panic
        assert!(is_initialized());
    }
}
