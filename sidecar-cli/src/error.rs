//! CLI error type.

use std::path::PathBuf;
use std::process::ExitCode;

use sidecar::bridge::BridgeError;
use sidecar::cache::ArtifactCacheError;
use sidecar::config::ConfigError;
use sidecar::logging::LoggingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    ConfigFile(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Cache(#[from] ArtifactCacheError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Invalid JSON input: {0}")]
    InvalidInput(#[from] serde_json::Error),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to start runtime: {0}")]
    Runtime(std::io::Error),
}

impl CliError {
    /// Process exit code: 2 for usage and configuration problems, 1 otherwise.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Config(_) | CliError::ConfigFile(_) | CliError::InvalidInput(_) => {
                ExitCode::from(2)
            }
            _ => ExitCode::FAILURE,
        }
    }
}
