//! Logging setup.
//!
//! Installs a `tracing` subscriber with console output and, optionally, a
//! daily-rolling log file. `RUST_LOG` overrides the configured level.
//!
//! ```ignore
//! let _guard = sidecar::logging::init_logging(&LoggingConfig::default())?;
//! // keep `_guard` alive until exit so buffered file output is flushed
//! ```

use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Default level when neither config nor `RUST_LOG` sets one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// File name prefix of rolled log files.
pub const LOG_FILE_NAME: &str = "sidecar.log";

/// Errors from logging setup.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to install log subscriber: {0}")]
    Install(String),
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `sidecar=debug`.
    pub level: String,
    /// Directory for rolling log files; console only when unset.
    pub directory: Option<PathBuf>,
    /// Include ANSI colors on the console.
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            directory: None,
            ansi: true,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Builds the filter: `RUST_LOG` if set, otherwise `level`.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::builder().parse_lossy(
            std::env::var("RUST_LOG").unwrap_or_else(|_| self.level.clone()),
        )
    }
}

/// Installs the global subscriber.
///
/// Returns the file writer's guard when file logging is enabled; dropping
/// it flushes and stops the background writer.
///
/// # Errors
///
/// Fails if the log directory cannot be created or a global subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, LoggingError> {
    let console = fmt::layer()
        .with_timer(LocalTime::rfc_3339())
        .with_target(true)
        .with_ansi(config.ansi)
        .with_writer(std::io::stderr)
        .boxed();

    let (file, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDir {
                path: dir.clone(),
                source,
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_timer(LocalTime::rfc_3339())
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(config.env_filter())
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| LoggingError::Install(e.to_string()))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.directory.is_none());
    }

    #[test]
    fn test_builder() {
        let config = LoggingConfig::default()
            .with_level("sidecar=debug")
            .with_directory("/var/log/sidecar")
            .with_ansi(false);
        assert_eq!(config.level, "sidecar=debug");
        assert_eq!(config.directory, Some(PathBuf::from("/var/log/sidecar")));
        assert!(!config.ansi);
    }

    #[test]
    fn test_init_creates_directory_and_returns_guard() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("logs");
        let config = LoggingConfig::default().with_directory(&dir).with_ansi(false);

        // Only one global subscriber per process; another test may own it.
        match init_logging(&config) {
            Ok(guard) => assert!(guard.is_some()),
            Err(LoggingError::Install(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
        assert!(dir.is_dir());
    }
}
