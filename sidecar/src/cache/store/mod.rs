//! Storage backends for the artifact cache.
//!
//! The cache owns eviction and accounting; a backend only persists entries
//! and their metadata records. Backends are interchangeable behind the
//! [`ArtifactStore`] trait.
//!
//! # Available Backends
//!
//! - [`MemoryStore`]: process memory, with an optional hard quota
//! - [`DirectoryStore`]: a flat directory of payload files and records
//!
//! # Dyn Compatibility
//!
//! Async methods return [`BoxFuture`] so that the cache can hold an
//! `Arc<dyn ArtifactStore>` chosen at runtime.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use super::error::StoreError;

mod directory;
mod memory;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Write progress callback: `(bytes_written, total_bytes)`.
pub type ProgressFn<'p> = dyn Fn(u64, u64) + Send + Sync + 'p;

/// Size of each chunk written before progress is reported (1 MB).
pub const WRITE_CHUNK_BYTES: usize = 1024 * 1024;

/// Metadata stored alongside each payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub key: String,
    /// Optional grouping, e.g. all files of one model.
    pub group_key: Option<String>,
    pub size_bytes: u64,
    /// Milliseconds since the UNIX epoch.
    pub stored_at: u64,
    /// Milliseconds since the UNIX epoch; drives LRU eviction.
    pub last_accessed_at: u64,
    pub schema_version: u32,
}

/// Persistence for cache entries.
///
/// Implementations must be safe to call concurrently. A `put` either
/// completes or leaves any previous entry under the key intact.
pub trait ArtifactStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Reads the payload stored under `key`.
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>, StoreError>>;

    /// Writes a payload and its record, replacing any existing entry.
    ///
    /// # Arguments
    ///
    /// * `record` - Metadata to persist; `record.key` names the entry
    /// * `bytes` - The payload
    /// * `progress` - Called as bytes reach the medium
    fn put<'a>(
        &'a self,
        record: &'a EntryRecord,
        bytes: &'a [u8],
        progress: Option<&'a ProgressFn<'a>>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Updates `last_accessed_at`. Returns false if the key is absent.
    fn touch(&self, key: &str, accessed_at: u64) -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Removes an entry. Returns false if the key was absent.
    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Returns the records of all complete entries.
    fn scan(&self) -> BoxFuture<'_, Result<Vec<EntryRecord>, StoreError>>;

    /// Removes every entry. The `meta` table is kept.
    fn clear(&self) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Reads a value from the `meta` table.
    fn get_meta(&self, name: &str) -> BoxFuture<'_, Result<Option<String>, StoreError>>;

    /// Writes a value to the `meta` table.
    fn put_meta(&self, name: &str, value: &str) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Rewrites every record with `schema_version`. Returns the count.
    fn restamp(&self, schema_version: u32) -> BoxFuture<'_, Result<u64, StoreError>>;
}

/// Reports chunked write progress for `total` bytes.
///
/// Always reports at least once, so an empty payload still reaches 100%.
pub(crate) fn report_chunks(total: usize, progress: Option<&ProgressFn<'_>>) {
    let Some(progress) = progress else {
        return;
    };
    if total == 0 {
        progress(0, 0);
        return;
    }
    let mut written = 0;
    while written < total {
        written = (written + WRITE_CHUNK_BYTES).min(total);
        progress(written as u64, total as u64);
    }
}
