//! Model runtime: the bridge and the artifact cache composed.
//!
//! Executors ask the runtime for model artifacts (fetched once, then served
//! from the cache) and run tasks through the bridge.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::bridge::{BridgeError, ExecuteOptions, Task, TaskBridge};
use crate::cache::{ArtifactCache, ArtifactCacheError, ArtifactMetadata};

/// Errors from [`ModelRuntime`] operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Cache(#[from] ArtifactCacheError),

    /// The artifact could not be obtained from its source.
    #[error("Failed to fetch artifact '{key}': {message}")]
    Fetch { key: String, message: String },
}

/// Bridge plus cache, shared by executors.
#[derive(Debug, Clone)]
pub struct ModelRuntime {
    bridge: Arc<TaskBridge>,
    cache: Arc<ArtifactCache>,
}

impl ModelRuntime {
    pub fn new(bridge: Arc<TaskBridge>, cache: Arc<ArtifactCache>) -> Self {
        Self { bridge, cache }
    }

    pub fn bridge(&self) -> &Arc<TaskBridge> {
        &self.bridge
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    /// Initializes the cache, then the bridge.
    pub async fn initialize(&self) -> Result<(), RuntimeError> {
        self.cache.initialize().await?;
        self.bridge.initialize().await?;
        info!("Model runtime ready");
        Ok(())
    }

    /// Returns the artifact under `key`, fetching and caching it on a miss.
    ///
    /// An artifact too large for the cache is still returned; it is just
    /// not retained.
    ///
    /// # Arguments
    ///
    /// * `key` - Cache key of the artifact
    /// * `metadata` - Stored with the artifact on a miss
    /// * `fetch` - Produces the bytes on a miss
    pub async fn ensure_artifact<F, Fut, E>(
        &self,
        key: &str,
        metadata: ArtifactMetadata,
        fetch: F,
    ) -> Result<Vec<u8>, RuntimeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
        E: std::fmt::Display,
    {
        if let Some(bytes) = self.cache.retrieve(key).await? {
            debug!(key, size_bytes = bytes.len(), "Artifact cache hit");
            return Ok(bytes);
        }

        debug!(key, "Artifact cache miss; fetching");
        let bytes = fetch().await.map_err(|e| RuntimeError::Fetch {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        match self.cache.store(key, &bytes, metadata).await {
            Ok(()) => {}
            Err(ArtifactCacheError::CapacityExceededAfterEviction {
                required,
                max_total_bytes,
            }) => {
                info!(
                    key,
                    required, max_total_bytes, "Artifact larger than cache; not retained"
                );
            }
            Err(e) => return Err(e.into()),
        }
        Ok(bytes)
    }

    /// Runs a task on the bridge.
    pub async fn run(&self, task: Task, options: ExecuteOptions) -> Result<Value, RuntimeError> {
        Ok(self.bridge.execute(task, options).await?)
    }

    /// Disposes the bridge and closes the cache.
    pub fn shutdown(&self) {
        self.bridge.dispose();
        self.cache.close();
    }
}
