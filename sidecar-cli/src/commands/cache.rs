//! Cache management CLI commands.

use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};

use clap::Subcommand;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use sidecar::cache::{ArtifactCache, ArtifactMetadata, StorageBackend};
use sidecar::config::{format_size, ConfigFile};

use crate::error::CliError;

/// Cache action subcommands.
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show cache occupancy and entries, least recently used first
    Stats,

    /// Remove every cached artifact
    Clear,

    /// Remove one artifact
    Delete {
        /// Artifact key
        key: String,
    },

    /// Remove every artifact in a group
    DeleteGroup {
        /// Group key, e.g. a model id
        group: String,
    },

    /// Store a file as an artifact
    Store {
        /// Artifact key
        key: String,

        /// File to read
        file: PathBuf,

        /// Group key to store with the artifact
        #[arg(long)]
        group: Option<String>,
    },

    /// Write a cached artifact to a file
    Get {
        /// Artifact key
        key: String,

        /// Destination file
        #[arg(short, long)]
        output: PathBuf,
    },
}

/// Run a cache subcommand.
pub async fn run(action: CacheAction, config: &ConfigFile) -> Result<(), CliError> {
    if !config.cache.enabled {
        return Err(CliError::Config(
            "The artifact cache is disabled. Set enabled = true under [cache] in config.ini."
                .to_string(),
        ));
    }
    if config.cache.backend == StorageBackend::Memory {
        println!(
            "{} cache backend is 'memory'; changes will not persist",
            style("note:").yellow()
        );
    }

    let cache = ArtifactCache::new(config.cache.clone());
    cache.initialize().await?;

    let result = match action {
        CacheAction::Stats => run_stats(&cache, config),
        CacheAction::Clear => run_clear(&cache).await,
        CacheAction::Delete { key } => run_delete(&cache, &key).await,
        CacheAction::DeleteGroup { group } => run_delete_group(&cache, &group).await,
        CacheAction::Store { key, file, group } => run_store(&cache, &key, file, group).await,
        CacheAction::Get { key, output } => run_get(&cache, &key, output).await,
    };
    cache.close();
    result
}

fn run_stats(cache: &ArtifactCache, config: &ConfigFile) -> Result<(), CliError> {
    let stats = cache.stats()?;

    match &config.cache.backend {
        StorageBackend::Directory(dir) => println!("Artifact cache: {}", dir.display()),
        StorageBackend::Memory => println!("Artifact cache: (memory)"),
    }
    println!("  Entries: {}", stats.count);
    println!(
        "  Size:    {} of {} ({:.1}%)",
        format_size(stats.total_bytes),
        format_size(stats.max_total_bytes),
        stats.utilization() * 100.0
    );

    if stats.entries.is_empty() {
        return Ok(());
    }
    println!();
    println!(
        "  {:<40} {:>10}  {:<16} {}",
        style("KEY").bold(),
        style("SIZE").bold(),
        style("GROUP").bold(),
        style("LAST ACCESSED").bold()
    );
    for entry in &stats.entries {
        println!(
            "  {:<40} {:>10}  {:<16} {}",
            entry.key,
            format_size(entry.size_bytes),
            entry.group_key.as_deref().unwrap_or("-"),
            format_age(entry.last_accessed_at)
        );
    }
    Ok(())
}

async fn run_clear(cache: &ArtifactCache) -> Result<(), CliError> {
    let before = cache.stats()?;
    cache.clear().await?;
    println!(
        "Deleted {} artifacts, freed {}",
        before.count,
        format_size(before.total_bytes)
    );
    Ok(())
}

async fn run_delete(cache: &ArtifactCache, key: &str) -> Result<(), CliError> {
    if cache.delete(key).await? {
        println!("Deleted {}", key);
    } else {
        println!("{} not found: {}", style("warning:").yellow(), key);
    }
    Ok(())
}

async fn run_delete_group(cache: &ArtifactCache, group: &str) -> Result<(), CliError> {
    let removed = cache.delete_group(group).await?;
    println!("Deleted {} artifacts in group {}", removed, group);
    Ok(())
}

async fn run_store(
    cache: &ArtifactCache,
    key: &str,
    file: PathBuf,
    group: Option<String>,
) -> Result<(), CliError> {
    let bytes = tokio::fs::read(&file).await.map_err(|source| CliError::Io {
        path: file.clone(),
        source,
    })?;

    let mut metadata = ArtifactMetadata::new();
    if let Some(group) = group {
        metadata = metadata.with_group(group);
    }

    let bar = ProgressBar::new(100);
    if let Ok(bar_style) =
        ProgressStyle::default_bar().template("[{bar:40.cyan/blue}] {pos:>3}% {msg}")
    {
        bar.set_style(bar_style.progress_chars("#>-"));
    }
    bar.set_message(format!("storing {}", format_size(bytes.len() as u64)));

    let progress = bar.clone();
    let result = cache
        .store_with_progress(key, &bytes, metadata, move |percent| {
            progress.set_position(percent.round() as u64)
        })
        .await;

    match result {
        Ok(()) => {
            bar.finish_and_clear();
            println!(
                "{} Stored {} ({})",
                style("✓").green().bold(),
                key,
                format_size(bytes.len() as u64)
            );
            Ok(())
        }
        Err(e) => {
            bar.abandon();
            Err(e.into())
        }
    }
}

async fn run_get(cache: &ArtifactCache, key: &str, output: PathBuf) -> Result<(), CliError> {
    let Some(bytes) = cache.retrieve(key).await? else {
        return Err(CliError::Config(format!("No cached artifact under '{}'", key)));
    };
    tokio::fs::write(&output, &bytes)
        .await
        .map_err(|source| CliError::Io {
            path: output.clone(),
            source,
        })?;
    println!(
        "Wrote {} to {}",
        format_size(bytes.len() as u64),
        output.display()
    );
    Ok(())
}

/// Renders a millisecond timestamp as time elapsed, e.g. `3m ago`.
fn format_age(timestamp_ms: u64) -> String {
    let Some(elapsed) = UNIX_EPOCH
        .checked_add(Duration::from_millis(timestamp_ms))
        .and_then(|then| then.elapsed().ok())
    else {
        return "just now".to_string();
    };
    let secs = elapsed.as_secs();
    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
