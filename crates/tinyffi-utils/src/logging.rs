//! # Logging Utilities
//!
//! Logging infrastructure for tinyffi using `tracing`.
//!
//! This module provides structured logging with support for:
//! - Pretty (development) and JSON (production) output
//! - Environment variable configuration
//! - Console output plus an optional log file
//! - File-only logging into a directory, one file per day
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tinyffi_utils::init_logging;
//!
//! // Initialize with default settings (reads from RUST_LOG env var)
//! init_logging().expect("Failed to initialize logging");
//!
//! tracing::info!("Application started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Log level filter (e.g., `RUST_LOG=debug`, `RUST_LOG=tinyffi_core=trace`)
//! - `TINYFFI_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
//! - `TINYFFI_LOG_FILE`: Optional path to a daily-rolling log file
//!
//! ## Examples
//!
//! ```rust,no_run
//! use tinyffi_utils::{LogFormat, LogLevel, init_logging_with_level};
//!
//! init_logging_with_level(LogLevel::Debug, LogFormat::Pretty).expect("Failed to initialize logging");
//! ```

use std::fmt as stdfmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "TINYFFI_LOG_FORMAT";

/// Environment variable naming an optional log file.
pub const LOG_FILE_ENV: &str = "TINYFFI_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default for development)
    #[default]
    Pretty,
    /// JSON format (default for production)
    Json,
}

impl FromStr for LogFormat
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {s}. Use 'pretty' or 'json'")),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    #[default]
    Info,
    /// Debug level
    Debug,
    /// Trace level (most verbose)
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!(
                "Unknown log level: {s}. Use 'error', 'warn', 'info', 'debug', or 'trace'"
            )),
        }
    }
}

impl stdfmt::Display for LogLevel
{
    fn fmt(&self, f: &mut stdfmt::Formatter<'_>) -> stdfmt::Result
    {
        stdfmt::Display::fmt(&Level::from(*self), f)
    }
}

/// Initialize logging with default settings
///
/// Reads configuration from environment variables:
/// - `RUST_LOG`: Log level filter (e.g., `debug`, `tinyffi_core=trace`)
/// - `TINYFFI_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
/// - `TINYFFI_LOG_FILE`: Optional path to a log file (rotated daily)
///
/// ## Errors
///
/// Returns an error if:
/// - Logging is already initialized
/// - `TINYFFI_LOG_FORMAT` holds an unknown format
pub fn init_logging() -> Result<(), LoggingError>
{
    let format = match env::var(LOG_FORMAT_ENV) {
        Ok(value) => LogFormat::from_str(&value).map_err(LoggingError::InvalidFormat)?,
        Err(_) => LogFormat::Pretty,
    };
    let log_file = env::var(LOG_FILE_ENV).ok().map(PathBuf::from);

    init_console(format, build_filter(None), log_file.as_deref())
}

/// Initialize logging with explicit level and format
///
/// `RUST_LOG` is ignored; the level applies to every target.
///
/// ## Errors
///
/// Returns an error if logging is already initialized.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<(), LoggingError>
{
    let log_file = env::var(LOG_FILE_ENV).ok().map(PathBuf::from);
    init_console(format, build_filter(Some(level)), log_file.as_deref())
}

/// Initialize file-only logging inside `dir`
///
/// Nothing is written to stdout. The file is named `YYYY-MM-DD-tinyffi.log`
/// after today's UTC date; `dir` is created if needed.
///
/// ## Arguments
///
/// * `level` - Optional log level. If `None`, uses `RUST_LOG` or defaults to `INFO`.
///
/// ## Example
///
/// ```rust,no_run
/// use tinyffi_utils::{LogLevel, init_logging_to_dir};
///
/// let path = init_logging_to_dir("/tmp/tinyffi-logs", Some(LogLevel::Debug))
///     .expect("Failed to initialize logging");
/// println!("logging to {}", path.display());
/// ```
///
/// ## Errors
///
/// Returns an error if logging is already initialized or the directory
/// cannot be created.
pub fn init_logging_to_dir(dir: impl AsRef<Path>, level: Option<LogLevel>) -> Result<PathBuf, LoggingError>
{
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let log_file = dir.join(log_file_name(&Utc::now().format("%Y-%m-%d").to_string()));
    let appender = tracing_appender::rolling::never(dir, log_file.file_name().unwrap_or_default());
    let (layer, guard) = file_layer(LogFormat::Pretty, appender, build_filter(level));

    Registry::default()
        .with(layer)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
    keep_guard(guard);

    Ok(log_file)
}

/// Name of the per-day log file for `date` (`YYYY-MM-DD`).
pub fn log_file_name(date: &str) -> String
{
    format!("{date}-tinyffi.log")
}

/// Build the level filter
///
/// Priority:
/// 1. An explicit level (from the `--log-level` CLI flag)
/// 2. `RUST_LOG`, which may hold per-target filters like `tinyffi_core=trace`
/// 3. `INFO`
fn build_filter(explicit: Option<LogLevel>) -> EnvFilter
{
    match explicit {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string())),
    }
}

fn init_console(format: LogFormat, filter: EnvFilter, log_file: Option<&Path>) -> Result<(), LoggingError>
{
    let mut layers = vec![console_layer(format, filter.clone())];
    let mut guard = None;

    if let Some(path) = log_file {
        let appender = tracing_appender::rolling::daily(
            path.parent().unwrap_or_else(|| Path::new(".")),
            path.file_name().unwrap_or_default(),
        );
        let (layer, file_guard) = file_layer(format, appender, filter);
        layers.push(layer);
        guard = Some(file_guard);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;

    if let Some(guard) = guard {
        keep_guard(guard);
    }
    Ok(())
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer
{
    let layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(io::stdout);

    match format {
        LogFormat::Pretty => layer.with_ansi(true).with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

fn file_layer(format: LogFormat, appender: RollingFileAppender, filter: EnvFilter) -> (BoxedLayer, WorkerGuard)
{
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339());

    let layer = match format {
        LogFormat::Pretty => layer.with_ansi(false).with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    };
    (layer, guard)
}

/// The writer thread flushes until its guard is dropped; logging lives for
/// the rest of the process.
fn keep_guard(guard: WorkerGuard)
{
    std::mem::forget(guard);
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_log_format_from_str()
    {
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("prod").unwrap(), LogFormat::Json);
        assert!(LogFormat::from_str("xml").is_err());
    }

    #[test]
    fn test_log_level_from_str()
    {
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("dbg").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("trace").unwrap(), LogLevel::Trace);
        assert!(LogLevel::from_str("loud").is_err());
    }

    #[test]
    fn test_log_level_display_matches_tracing()
    {
        assert_eq!(LogLevel::Debug.to_string(), Level::DEBUG.to_string());
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_log_file_name()
    {
        assert_eq!(log_file_name("2026-10-19"), "2026-10-19-tinyffi.log");
    }

    #[test]
    fn test_explicit_level_wins()
    {
        let filter = build_filter(Some(LogLevel::Trace));
        assert_eq!(filter.to_string(), "trace");
    }
}
