//! Run command - execute one task through the bridge.
//!
//! Tasks run on the in-process demo worker. Progress events drive a
//! progress bar; Ctrl-C cancels the request.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use sidecar::bridge::{
    ExecuteOptions, InProcessWorker, ProgressEvent, RetryPolicy, TaskBridge, TaskKind,
};
use sidecar::config::ConfigFile;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::demo::DemoHandler;
use crate::error::CliError;

/// Delay between retry attempts.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Arguments for the run command.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Task name (load_model, summarize, translate, classify, embed, transcribe)
    pub task: String,

    /// Task payload as JSON, e.g. '{"text": "..."}'
    #[arg(short, long, default_value = "{}")]
    pub input: String,

    /// Request timeout in milliseconds (defaults to [bridge] default_timeout_secs)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Retry attempts after a timeout or remote failure
    #[arg(long, default_value_t = 0)]
    pub retries: u32,

    /// Do not draw a progress bar
    #[arg(short, long)]
    pub quiet: bool,
}

/// Run the run command.
pub async fn run(args: RunArgs, config: &ConfigFile) -> Result<(), CliError> {
    let kind: TaskKind = args.task.parse().map_err(|_| {
        CliError::Config(format!(
            "Unknown task '{}'. Expected one of: {}",
            args.task,
            TaskKind::ALL
                .iter()
                .map(TaskKind::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        ))
    })?;
    let payload: Value = serde_json::from_str(&args.input)?;

    let bridge = TaskBridge::new(
        config.bridge.clone(),
        Arc::new(InProcessWorker::new(DemoHandler)),
    );
    bridge.initialize().await?;

    let bar = if args.quiet {
        ProgressBar::hidden()
    } else {
        progress_bar()
    };
    let cancel = CancellationToken::new();

    let mut options = ExecuteOptions::new()
        .with_cancellation(cancel.clone())
        .with_progress({
            let bar = bar.clone();
            move |event: &ProgressEvent| {
                bar.set_position(event.progress.round() as u64);
                bar.set_message(event.status.clone());
            }
        });
    if let Some(ms) = args.timeout_ms {
        options = options.with_timeout(Duration::from_millis(ms));
    }
    if args.retries > 0 {
        options = options.with_retry(RetryPolicy::fixed(args.retries + 1, RETRY_DELAY));
    }

    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; cancelling request");
                cancel.cancel();
            }
        }
    });

    let outcome = bridge.execute_named(kind.as_str(), payload, options).await;
    interrupt.abort();
    bridge.dispose();

    match outcome {
        Ok(value) => {
            bar.finish_and_clear();
            println!("{} {}", style("✓").green().bold(), style(kind.as_str()).bold());
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            bar.abandon_with_message(style("failed").red().to_string());
            Err(e.into())
        }
    }
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
    {
        bar.set_style(bar_style.progress_chars("#>-"));
    }
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}
