//! Sidecar CLI - command-line front end for the sidecar library.
//!
//! Runs tasks through the bridge on an in-process worker and manages the
//! persistent artifact cache.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::style;
use sidecar::config::{config_file_path, ConfigFile};
use sidecar::logging::init_logging;
use tracing::debug;

use commands::cache::CacheAction;
use commands::config::ConfigCommands;
use commands::run::RunArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "sidecar", version = sidecar::VERSION, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ~/.config/sidecar/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a task on the in-process worker
    Run(RunArgs),

    /// Manage the artifact cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            e.exit_code()
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let path = match cli.config {
        Some(path) => path,
        None => config_file_path()?,
    };
    let config = if path.exists() {
        ConfigFile::load_from(&path)?
    } else {
        ConfigFile::default()
    };

    let mut logging = config.logging.clone();
    if cli.verbose {
        logging = logging.with_level("debug");
    }
    let _guard = init_logging(&logging)?;
    debug!(config = %path.display(), "Configuration loaded");

    if let Commands::Config { command } = cli.command {
        return commands::config::run(command, &config, &path);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    runtime.block_on(async {
        match cli.command {
            Commands::Run(args) => commands::run::run(args, &config).await,
            Commands::Cache { action } => commands::cache::run(action, &config).await,
            Commands::Config { .. } => Ok(()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_options() {
        let cli = Cli::try_parse_from([
            "sidecar",
            "run",
            "summarize",
            "--input",
            r#"{"text": "hello"}"#,
            "--timeout-ms",
            "500",
            "--retries",
            "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.task, "summarize");
                assert_eq!(args.timeout_ms, Some(500));
                assert_eq!(args.retries, 2);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_cache_store_with_group() {
        let cli = Cli::try_parse_from([
            "sidecar",
            "cache",
            "store",
            "whisper/weights",
            "weights.bin",
            "--group",
            "whisper",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cache {
                action: CacheAction::Store { ref group, .. }
            } if group.as_deref() == Some("whisper")
        ));
    }
}
