//! Configuration management CLI commands.

use std::path::Path;

use clap::Subcommand;
use console::style;
use sidecar::config::{config_file_path, ConfigFile};

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration in INI form
    Show,

    /// Write a configuration file with default settings
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the configuration file path
    Path,
}

/// Run a config subcommand.
pub fn run(command: ConfigCommands, config: &ConfigFile, path: &Path) -> Result<(), CliError> {
    match command {
        ConfigCommands::Show => run_show(config),
        ConfigCommands::Init { force } => run_init(path, force),
        ConfigCommands::Path => {
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn run_show(config: &ConfigFile) -> Result<(), CliError> {
    let mut buffer = Vec::new();
    config
        .to_ini()
        .write_to(&mut buffer)
        .map_err(|source| CliError::Io {
            path: config_file_path().unwrap_or_default(),
            source,
        })?;
    print!("{}", String::from_utf8_lossy(&buffer));
    Ok(())
}

fn run_init(path: &Path, force: bool) -> Result<(), CliError> {
    if path.exists() && !force {
        return Err(CliError::Config(format!(
            "{} already exists. Use --force to overwrite it.",
            path.display()
        )));
    }

    ConfigFile::default().save_to(path)?;
    println!("{} Wrote {}", style("✓").green().bold(), path.display());
    println!();
    println!("Edit this file to customize sidecar settings.");
    println!("RUST_LOG overrides the [logging] level when set.");
    Ok(())
}
