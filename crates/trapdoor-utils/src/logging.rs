//! # Logging Utilities
//!
//! Logging setup for programs and tests built on `trapdoor-core`.
//!
//! The engine itself only emits `tracing` events; nothing is printed until a
//! subscriber is installed. This module installs one with:
//! - Pretty or JSON output
//! - `RUST_LOG` filtering
//! - An optional daily-rolling log file written off-thread
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use trapdoor_utils::init_logging;
//!
//! // Keep the guard alive for as long as logs should be flushed to the file.
//! let _guard = init_logging().expect("Failed to initialize logging");
//! tracing::info!("Tracer started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: filter directives (e.g. `debug`, `trapdoor_core=trace`)
//! - `TRAPDOOR_LOG_FORMAT`: `pretty` (default) or `json`
//! - `TRAPDOOR_LOG_FILE`: optional log file path; the directory part is
//!   where daily files are rotated
//!
//! Console output goes to stderr so it never mixes with a tracee's stdout.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Once;
use std::{env, io};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Output format env var
pub const ENV_LOG_FORMAT: &str = "TRAPDOOR_LOG_FORMAT";
/// Log file env var
pub const ENV_LOG_FILE: &str = "TRAPDOOR_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable lines (default)
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    Info,
    /// Debug level
    Debug,
    /// Trace level; logs every ptrace request
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
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Keeps the background file writer alive
///
/// Dropping the guard flushes and stops the writer thread. Hold it in
/// `main` (or wherever the program's lifetime ends).
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug)]
pub struct LoggingGuard
{
    file: Option<WorkerGuard>,
}

impl LoggingGuard
{
    /// Whether a log file is being written.
    #[must_use]
    pub fn writes_file(&self) -> bool
    {
        self.file.is_some()
    }
}

/// Initialize logging from the environment
///
/// ## Errors
///
/// - `InvalidFormat` if `TRAPDOOR_LOG_FORMAT` is set to something unknown
/// - `FileError` / `InvalidFile` if `TRAPDOOR_LOG_FILE` cannot be used
/// - `InitializationFailed` if a global subscriber is already installed
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    let format = match env::var(ENV_LOG_FORMAT) {
        Ok(raw) => raw.parse()?,
        Err(_) => LogFormat::default(),
    };
    let log_file = env::var_os(ENV_LOG_FILE).map(PathBuf::from);
    install(format, Level::INFO, log_file.as_deref())
}

/// Initialize logging with an explicit default level and format
///
/// `RUST_LOG` still wins when set.
///
/// ## Example
///
/// ```rust,no_run
/// use trapdoor_utils::{init_logging_with_level, LogFormat, LogLevel};
///
/// let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Json, None)
///     .expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Same as [`init_logging`], minus the environment parsing.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat, log_file: Option<&Path>) -> Result<LoggingGuard, LoggingError>
{
    install(format, level.into(), log_file)
}

/// Install a test-friendly subscriber once per process
///
/// Output is captured by the test harness; `RUST_LOG` selects the level
/// (default `warn`). Safe to call from every test.
pub fn init_test_logging()
{
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        // Another subscriber may already be installed by the test binary.
        let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
    });
}

fn filter(default_level: Level) -> EnvFilter
{
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()))
}

fn install(format: LogFormat, default_level: Level, log_file: Option<&Path>) -> Result<LoggingGuard, LoggingError>
{
    let mut layers: Vec<BoxedLayer> = vec![console_layer(format, filter(default_level))];
    let mut file = None;

    if let Some(path) = log_file {
        let (directory, name) = file_parts(path)?;
        std::fs::create_dir_all(&directory)?;
        let appender = tracing_appender::rolling::daily(directory, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(file_layer(format, writer, filter(default_level)));
        file = Some(guard);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|error| LoggingError::InitializationFailed(error.to_string()))?;
    Ok(LoggingGuard { file })
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer
{
    let layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(io::stderr);
    match format {
        LogFormat::Pretty => layer.with_ansi(true).with_filter(filter).boxed(),
        LogFormat::Json => layer.json().with_current_span(true).with_span_list(true).with_filter(filter).boxed(),
    }
}

fn file_layer(format: LogFormat, writer: tracing_appender::non_blocking::NonBlocking, filter: EnvFilter) -> BoxedLayer
{
    let layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(writer);
    match format {
        // No ANSI in files
        LogFormat::Pretty => layer.with_ansi(false).with_filter(filter).boxed(),
        LogFormat::Json => layer.json().with_current_span(true).with_span_list(true).with_filter(filter).boxed(),
    }
}

/// Split a log file path into (directory, file name prefix).
fn file_parts(path: &Path) -> Result<(PathBuf, PathBuf), LoggingError>
{
    let name = path
        .file_name()
        .ok_or_else(|| LoggingError::InvalidFile(path.to_path_buf()))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((directory, PathBuf::from(name)))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Unknown log format: {0} (use 'pretty' or 'json')")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Unknown log level: {0} (use 'error', 'warn', 'info', 'debug' or 'trace')")]
    InvalidLevel(String),

    /// The log file path has no file name component
    #[error("Log file path has no file name: {}", .0.display())]
    InvalidFile(PathBuf),

    /// A global subscriber was already installed
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
        assert_eq!(LogFormat::from_str(" JSON ").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("text").unwrap(), LogFormat::Pretty);
        assert!(matches!(LogFormat::from_str("xml"), Err(LoggingError::InvalidFormat(raw)) if raw == "xml"));
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }

    #[test]
    fn test_log_level_from_str()
    {
        assert_eq!(LogLevel::from_str("error").unwrap(), LogLevel::Error);
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("info").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::from_str("Debug").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("trace").unwrap(), LogLevel::Trace);
        assert!(LogLevel::from_str("loud").is_err());
    }

    #[test]
    fn test_log_level_to_tracing_level()
    {
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(Level::from(LogLevel::Warn), Level::WARN);
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_file_parts()
    {
        let (directory, name) = file_parts(Path::new("/var/log/trapdoor.log")).unwrap();
        assert_eq!(directory, PathBuf::from("/var/log"));
        assert_eq!(name, PathBuf::from("trapdoor.log"));

        let (directory, _) = file_parts(Path::new("trapdoor.log")).unwrap();
        assert_eq!(directory, PathBuf::from("."));

        assert!(matches!(file_parts(Path::new("/")), Err(LoggingError::InvalidFile(_))));
    }

    #[test]
    fn test_init_test_logging_is_idempotent()
    {
        init_test_logging();
        init_test_logging();
        tracing::debug!("still fine");
    }
}
