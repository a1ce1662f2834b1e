//! Sidecar - off-main-path inference bridge with a persistent artifact cache
//!
//! This library runs machine-learning inference outside the caller's control
//! path. It is built from two independent subsystems:
//!
//! - [`bridge`]: the task-dispatch bridge. Correlates requests with
//!   asynchronous worker responses, gates concurrency, and enforces timeouts
//!   and cancellation.
//! - [`cache`]: the persistent artifact cache. Stores large binary payloads
//!   (model weights, tokenizers) with capacity-bounded LRU eviction.
//!
//! [`runtime::ModelRuntime`] composes both for executors that need a model
//! artifact resident before they run a task.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sidecar::bridge::{BridgeConfig, ExecuteOptions, InProcessWorker, Task, TaskBridge};
//! use sidecar::cache::{ArtifactCache, CacheConfig};
//!
//! let bridge = TaskBridge::new(BridgeConfig::default(), Arc::new(InProcessWorker::new(handler)));
//! bridge.initialize().await?;
//! let summary = bridge.execute(Task::summarize("long text..."), ExecuteOptions::new()).await?;
//!
//! let cache = ArtifactCache::new(CacheConfig::directory("/var/cache/sidecar", 2 << 30));
//! cache.initialize().await?;
//! ```

pub mod bridge;
pub mod cache;
pub mod config;
pub mod logging;
pub mod runtime;

/// Library version, as recorded in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current wall-clock time in milliseconds since the UNIX epoch.
///
/// Returns 0 if the system clock is set before the epoch.
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
