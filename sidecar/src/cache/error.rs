//! Error types for the artifact cache.

use thiserror::Error;

/// Errors raised by an [`ArtifactStore`](super::ArtifactStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error on the storage medium.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A metadata record could not be encoded or decoded.
    #[error("Record encoding error: {0}")]
    Encoding(String),

    /// The medium refused the write.
    #[error("Storage quota exceeded: {requested} bytes requested, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Encoding(e.to_string())
    }
}

/// Errors surfaced by [`ArtifactCache`](super::ArtifactCache) operations.
#[derive(Debug, Error)]
pub enum ArtifactCacheError {
    /// The cache was never initialized, or was closed.
    #[error("Artifact cache is not initialized")]
    NotInitialized,

    /// The payload cannot fit even after evicting everything evictable.
    #[error("Artifact of {required} bytes does not fit in a cache of {max_total_bytes} bytes")]
    CapacityExceededAfterEviction { required: u64, max_total_bytes: u64 },

    /// The backing store failed.
    #[error("Storage fault: {0}")]
    StorageFault(#[from] StoreError),

    /// The backing store could not be opened.
    #[error("Artifact cache initialization failed: {0}")]
    InitializationFailure(String),

    /// The store was written by a newer schema than this build understands.
    #[error("Incompatible cache schema: store has version {stored}, this build supports up to {supported}")]
    IncompatibleSchema { stored: u32, supported: u32 },
}
