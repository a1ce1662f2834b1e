//! Persistent artifact cache.
//!
//! Stores large binary payloads keyed by identity, bounded by a total size
//! limit with least-recently-used eviction.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     ArtifactCache                       │
//! │  write lock ─► eviction + size check + put  │  index    │
//! └────────────────────────────┬────────────────────────────┘
//!                              │ Arc<dyn ArtifactStore>
//!               ┌──────────────┴──────────────┐
//!               ▼                             ▼
//!        ┌─────────────┐              ┌────────────────┐
//!        │ MemoryStore │              │ DirectoryStore │
//!        └─────────────┘              └────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! let cache = ArtifactCache::new(CacheConfig::directory("/var/cache/sidecar", 2 << 30));
//! cache.initialize().await?;
//!
//! cache.store("whisper-small/weights", &bytes, ArtifactMetadata::new().with_group("whisper-small")).await?;
//! let weights = cache.retrieve("whisper-small/weights").await?;
//! ```

mod artifact;
mod clock;
mod config;
mod error;
mod schema;
pub mod store;

pub use artifact::{ArtifactCache, ArtifactMetadata, CacheStats, EntryStats};
pub use config::{
    default_cache_dir, CacheConfig, StorageBackend, CURRENT_SCHEMA_VERSION,
    DEFAULT_MAX_TOTAL_BYTES,
};
pub use error::{ArtifactCacheError, StoreError};
pub use schema::SCHEMA_VERSION_KEY;
pub use store::{ArtifactStore, DirectoryStore, EntryRecord, MemoryStore};
