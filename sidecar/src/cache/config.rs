//! Configuration for the artifact cache.

use std::path::PathBuf;

/// Default capacity (2 GB).
pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Where cached artifacts live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Process memory; contents are lost on close.
    Memory,
    /// A flat directory of payload files and metadata records.
    Directory(PathBuf),
}

/// Returns the default on-disk cache location.
///
/// `~/.cache/sidecar/artifacts` on Linux, falling back to the working
/// directory when no cache directory is known.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sidecar")
        .join("artifacts")
}

/// Configuration for [`ArtifactCache`](super::ArtifactCache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// When false, stores are no-ops and lookups miss.
    pub enabled: bool,

    /// Upper bound on the summed size of all entries.
    pub max_total_bytes: u64,

    /// Schema version to open the store with.
    pub schema_version: u32,

    pub backend: StorageBackend,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            schema_version: CURRENT_SCHEMA_VERSION,
            backend: StorageBackend::Directory(default_cache_dir()),
        }
    }
}

impl CacheConfig {
    /// In-memory cache bounded at `max_total_bytes`.
    pub fn memory(max_total_bytes: u64) -> Self {
        Self {
            max_total_bytes,
            backend: StorageBackend::Memory,
            ..Self::default()
        }
    }

    /// On-disk cache rooted at `root`, bounded at `max_total_bytes`.
    pub fn directory(root: impl Into<PathBuf>, max_total_bytes: u64) -> Self {
        Self {
            max_total_bytes,
            backend: StorageBackend::Directory(root.into()),
            ..Self::default()
        }
    }

    /// A cache that stores nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            backend: StorageBackend::Memory,
            ..Self::default()
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_total_bytes(mut self, max_total_bytes: u64) -> Self {
        self.max_total_bytes = max_total_bytes;
        self
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }
}
