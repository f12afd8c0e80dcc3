//! Logging setup for the callback server binary and embedding hosts.
//!
//! The library itself only emits `tracing` events; nothing is printed unless a
//! subscriber is installed, either by the host or through [`init_logging`].

use std::str::FromStr;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Selects the logging mode.
pub const LOG_MODE_ENV: &str = "JSMS_LOG_MODE";

/// Overrides the filter directives. Falls back to `RUST_LOG`.
pub const LOG_LEVEL_ENV: &str = "JSMS_LOG_LEVEL";

/// How log output is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// No subscriber is installed
    Silent,
    /// Compact stderr output at `info`
    Development,
    /// Verbose output with source locations at `debug`
    Debug,
    /// One JSON object per line at `info`, for log shippers
    Json,
}

impl LoggingMode {
    fn default_level(self) -> &'static str {
        match self {
            LoggingMode::Silent => "off",
            LoggingMode::Development | LoggingMode::Json => "info",
            LoggingMode::Debug => "debug",
        }
    }
}

impl FromStr for LoggingMode {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silent" | "off" => Ok(LoggingMode::Silent),
            "development" | "dev" => Ok(LoggingMode::Development),
            "debug" => Ok(LoggingMode::Debug),
            "json" => Ok(LoggingMode::Json),
            other => Err(LoggingError::InvalidEnv(format!(
                "{LOG_MODE_ENV}={other:?} (expected silent, development, debug or json)"
            ))),
        }
    }
}

/// Logging configuration error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("Invalid environment variable: {0}")]
    InvalidEnv(String),
}

/// Install a global subscriber for `mode`.
///
/// Fails if a subscriber is already installed.
///
/// # Environment Variables
///
/// - `JSMS_LOG_LEVEL`: filter directives, e.g. `callback_server=debug`
/// - `RUST_LOG`: used when `JSMS_LOG_LEVEL` is unset
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if mode == LoggingMode::Silent {
        return Ok(());
    }

    let filter = create_env_filter(mode.default_level(), |key| std::env::var(key).ok())?;

    match mode {
        LoggingMode::Silent => Ok(()),
        LoggingMode::Development => Registry::default()
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .with(filter)
            .try_init()
            .map_err(|e| LoggingError::TracingInit(e.to_string())),
        LoggingMode::Debug => Registry::default()
            .with(
                fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(filter)
            .try_init()
            .map_err(|e| LoggingError::TracingInit(e.to_string())),
        LoggingMode::Json => Registry::default()
            .with(fmt::layer().json().with_current_span(true))
            .with(filter)
            .try_init()
            .map_err(|e| LoggingError::TracingInit(e.to_string())),
    }
}

/// Initialize logging from `JSMS_LOG_MODE`, defaulting to development output.
pub fn init_logging_from_env() -> Result<LoggingMode, LoggingError> {
    let mode = mode_from_lookup(|key| std::env::var(key).ok())?;
    init_logging(mode)?;
    Ok(mode)
}

fn mode_from_lookup<F>(lookup: F) -> Result<LoggingMode, LoggingError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(LOG_MODE_ENV) {
        Some(mode) if !mode.trim().is_empty() => mode.parse(),
        _ => Ok(LoggingMode::Development),
    }
}

/// Build the filter from `JSMS_LOG_LEVEL`, then `RUST_LOG`, then `default_level`.
fn create_env_filter<F>(default_level: &str, lookup: F) -> Result<EnvFilter, LoggingError>
where
    F: Fn(&str) -> Option<String>,
{
    let (source, directives) = match (lookup(LOG_LEVEL_ENV), lookup("RUST_LOG")) {
        (Some(level), _) => (LOG_LEVEL_ENV, level),
        (None, Some(rust_log)) => ("RUST_LOG", rust_log),
        (None, None) => return Ok(EnvFilter::new(default_level)),
    };

    EnvFilter::try_new(&directives)
        .map_err(|e| LoggingError::InvalidEnv(format!("{source}={directives:?}: {e}")))
}
