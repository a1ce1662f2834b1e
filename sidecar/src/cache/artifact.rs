//! The artifact cache.
//!
//! [`ArtifactCache`] keeps large binary payloads (model weights, tokenizer
//! files) in an [`ArtifactStore`] and bounds their total size with
//! least-recently-used eviction.
//!
//! # Accounting
//!
//! An in-memory index mirrors every record in the store. It is rebuilt from
//! a scan at `initialize()` and updated in the same critical section as each
//! backend write, so size checks never touch the medium.
//!
//! # Concurrency
//!
//! Writes (store, delete, clear, eviction) and access-time updates are
//! serialized by one async write lock: eviction, size check and insert form
//! a single step. Payload reads run outside that lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::clock::AccessClock;
use super::config::{CacheConfig, StorageBackend};
use super::error::ArtifactCacheError;
use super::schema::{self, Migration};
use super::store::{ArtifactStore, DirectoryStore, EntryRecord, MemoryStore, ProgressFn};

// =============================================================================
// Public Types
// =============================================================================

/// Caller-supplied metadata stored with an artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactMetadata {
    /// Groups related artifacts so they can be removed together.
    pub group_key: Option<String>,
}

impl ArtifactMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group_key: impl Into<String>) -> Self {
        self.group_key = Some(group_key.into());
        self
    }
}

/// One entry in a [`CacheStats`] snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStats {
    pub key: String,
    pub group_key: Option<String>,
    pub size_bytes: u64,
    pub stored_at: u64,
    pub last_accessed_at: u64,
}

/// Point-in-time view of cache occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total_bytes: u64,
    pub count: usize,
    pub max_total_bytes: u64,
    /// Entries ordered by `last_accessed_at`, least recent first.
    pub entries: Vec<EntryStats>,
}

impl CacheStats {
    /// Fraction of capacity in use, `0.0..=1.0`.
    pub fn utilization(&self) -> f64 {
        if self.max_total_bytes == 0 {
            return 0.0;
        }
        self.total_bytes as f64 / self.max_total_bytes as f64
    }
}

// =============================================================================
// Index
// =============================================================================

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<String, EntryRecord>,
    total_bytes: u64,
}

impl CacheIndex {
    fn from_records(records: Vec<EntryRecord>) -> Self {
        let mut index = Self::default();
        for record in records {
            index.insert(record);
        }
        index
    }

    fn insert(&mut self, record: EntryRecord) {
        self.total_bytes += record.size_bytes;
        if let Some(previous) = self.entries.insert(record.key.clone(), record) {
            self.total_bytes -= previous.size_bytes;
        }
    }

    fn remove(&mut self, key: &str) -> Option<EntryRecord> {
        let record = self.entries.remove(key)?;
        self.total_bytes -= record.size_bytes;
        Some(record)
    }

    fn size_of(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|record| record.size_bytes)
    }

    fn touch(&mut self, key: &str, stamp: u64) {
        if let Some(record) = self.entries.get_mut(key) {
            record.last_accessed_at = stamp;
        }
    }

    /// Least recently accessed key, ignoring `exclude`.
    fn lru_victim(&self, exclude: Option<&str>) -> Option<String> {
        self.entries
            .values()
            .filter(|record| Some(record.key.as_str()) != exclude)
            .min_by(|a, b| {
                a.last_accessed_at
                    .cmp(&b.last_accessed_at)
                    .then_with(|| a.key.cmp(&b.key))
            })
            .map(|record| record.key.clone())
    }

    fn keys_in_group(&self, group_key: &str) -> Vec<String> {
        self.entries
            .values()
            .filter(|record| record.group_key.as_deref() == Some(group_key))
            .map(|record| record.key.clone())
            .collect()
    }

    fn latest_access(&self) -> u64 {
        self.entries
            .values()
            .map(|record| record.last_accessed_at)
            .max()
            .unwrap_or(0)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }
}

struct OpenCache {
    store: Arc<dyn ArtifactStore>,
    index: Mutex<CacheIndex>,
}

enum StoreSource {
    Configured,
    Injected(Arc<dyn ArtifactStore>),
}

// =============================================================================
// Artifact Cache
// =============================================================================

/// Capacity-bounded persistent cache for binary artifacts.
///
/// Construct one per storage location and share it by `Arc`.
pub struct ArtifactCache {
    config: CacheConfig,
    source: StoreSource,
    state: RwLock<Option<Arc<OpenCache>>>,
    init_lock: tokio::sync::Mutex<()>,
    write_lock: tokio::sync::Mutex<()>,
    clock: AccessClock,
}

impl ArtifactCache {
    /// Creates a closed cache using the backend named by `config`.
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, StoreSource::Configured)
    }

    /// Creates a closed cache over an existing store.
    ///
    /// `config.backend` is ignored.
    pub fn with_store(config: CacheConfig, store: Arc<dyn ArtifactStore>) -> Self {
        Self::build(config, StoreSource::Injected(store))
    }

    fn build(config: CacheConfig, source: StoreSource) -> Self {
        Self {
            config,
            source,
            state: RwLock::new(None),
            init_lock: tokio::sync::Mutex::new(()),
            write_lock: tokio::sync::Mutex::new(()),
            clock: AccessClock::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns true between `initialize()` and `close()`.
    pub fn is_open(&self) -> bool {
        self.state.read().is_some()
    }

    /// Opens the backing store and rebuilds the index.
    ///
    /// Idempotent; concurrent callers share a single open. Runs schema
    /// migration, then evicts down to capacity if the store holds more
    /// than `max_total_bytes` (for example after the limit was lowered).
    ///
    /// # Errors
    ///
    /// - [`ArtifactCacheError::InitializationFailure`] if the store cannot
    ///   be opened or scanned
    /// - [`ArtifactCacheError::IncompatibleSchema`] if the store was written
    ///   by a newer schema
    pub async fn initialize(&self) -> Result<(), ArtifactCacheError> {
        if self.is_open() {
            return Ok(());
        }
        let _init = self.init_lock.lock().await;
        if self.is_open() {
            return Ok(());
        }

        let store = self.open_store().await?;
        if !self.config.enabled {
            *self.state.write() = Some(Arc::new(OpenCache {
                store,
                index: Mutex::new(CacheIndex::default()),
            }));
            info!("Artifact cache disabled");
            return Ok(());
        }

        let migration = schema::migrate(store.as_ref(), self.config.schema_version).await?;
        let records = store.scan().await.map_err(|e| {
            ArtifactCacheError::InitializationFailure(format!("scan failed: {}", e))
        })?;

        let index = CacheIndex::from_records(records);
        self.clock.observe(index.latest_access());
        let open = Arc::new(OpenCache {
            store,
            index: Mutex::new(index),
        });

        let evicted = {
            let _write = self.write_lock.lock().await;
            self.make_room(&open, None, 0).await?
        };

        let (count, total_bytes) = {
            let index = open.index.lock();
            (index.entries.len(), index.total_bytes)
        };
        info!(
            backend = open.store.name(),
            count,
            total_bytes,
            max_total_bytes = self.config.max_total_bytes,
            evicted,
            migrated = matches!(migration, Migration::Upgraded { .. }),
            "Artifact cache opened"
        );

        *self.state.write() = Some(open);
        Ok(())
    }

    /// Stores an artifact, evicting least recently used entries as needed.
    ///
    /// Replaces any existing entry under `key`. No-op when disabled.
    ///
    /// # Errors
    ///
    /// - [`ArtifactCacheError::NotInitialized`]
    /// - [`ArtifactCacheError::CapacityExceededAfterEviction`] if `bytes` is
    ///   larger than the whole cache; nothing is evicted in that case
    /// - [`ArtifactCacheError::StorageFault`] if the medium rejects the write
    pub async fn store(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: ArtifactMetadata,
    ) -> Result<(), ArtifactCacheError> {
        self.store_inner(key, bytes, metadata, None).await
    }

    /// Like [`store`](Self::store), reporting write progress as a
    /// percentage from 0 to 100.
    pub async fn store_with_progress<F>(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: ArtifactMetadata,
        on_progress: F,
    ) -> Result<(), ArtifactCacheError>
    where
        F: Fn(f32) + Send + Sync,
    {
        let relay = |written: u64, total: u64| {
            let percent = if total == 0 {
                100.0
            } else {
                (written as f64 / total as f64 * 100.0) as f32
            };
            on_progress(percent);
        };
        on_progress(0.0);
        self.store_inner(key, bytes, metadata, Some(&relay)).await
    }

    async fn store_inner(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: ArtifactMetadata,
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<(), ArtifactCacheError> {
        let open = self.open()?;
        if !self.config.enabled {
            debug!(key, "Cache disabled; store skipped");
            return Ok(());
        }

        let required = bytes.len() as u64;
        let max_total_bytes = self.config.max_total_bytes;
        if required > max_total_bytes {
            return Err(ArtifactCacheError::CapacityExceededAfterEviction {
                required,
                max_total_bytes,
            });
        }

        let _write = self.write_lock.lock().await;
        let evicted = self.make_room(&open, Some(key), required).await?;

        let now = self.clock.now();
        let record = EntryRecord {
            key: key.to_string(),
            group_key: metadata.group_key,
            size_bytes: required,
            stored_at: now,
            last_accessed_at: now,
            schema_version: self.config.schema_version,
        };
        open.store.put(&record, bytes, progress).await?;
        open.index.lock().insert(record);

        debug!(key, size_bytes = required, evicted, "Artifact stored");
        Ok(())
    }

    /// Evicts LRU entries until `required` bytes fit.
    ///
    /// The entry under `key`, if any, counts as free space since it is
    /// about to be replaced. Caller holds the write lock.
    async fn make_room(
        &self,
        open: &OpenCache,
        key: Option<&str>,
        required: u64,
    ) -> Result<usize, ArtifactCacheError> {
        let max_total_bytes = self.config.max_total_bytes;
        let mut evicted = 0;

        loop {
            let victim = {
                let index = open.index.lock();
                let reclaimable = key.and_then(|k| index.size_of(k)).unwrap_or(0);
                let used = index.total_bytes - reclaimable;
                if used.saturating_add(required) <= max_total_bytes {
                    return Ok(evicted);
                }
                index.lru_victim(key)
            };

            let Some(victim) = victim else {
                return Err(ArtifactCacheError::CapacityExceededAfterEviction {
                    required,
                    max_total_bytes,
                });
            };

            open.store.delete(&victim).await?;
            if let Some(record) = open.index.lock().remove(&victim) {
                evicted += 1;
                info!(
                    key = %victim,
                    size_bytes = record.size_bytes,
                    last_accessed_at = record.last_accessed_at,
                    "Evicted artifact"
                );
            }
        }
    }

    /// Returns the artifact under `key` and marks it most recently used.
    ///
    /// `None` if missing or the cache is disabled.
    pub async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, ArtifactCacheError> {
        let open = self.open()?;
        if !self.config.enabled || !open.index.lock().entries.contains_key(key) {
            return Ok(None);
        }

        let bytes = open.store.get(key).await?;
        let _write = self.write_lock.lock().await;

        let Some(bytes) = bytes else {
            if open.index.lock().remove(key).is_some() {
                warn!(key, "Cached artifact vanished from storage; dropped from index");
            }
            return Ok(None);
        };

        // Deleted or evicted while the payload was being read.
        if !open.index.lock().entries.contains_key(key) {
            return Ok(Some(bytes));
        }

        let stamp = self.clock.now();
        open.store.touch(key, stamp).await?;
        open.index.lock().touch(key, stamp);
        Ok(Some(bytes))
    }

    /// Returns true if `key` is cached. Does not count as an access.
    pub fn has(&self, key: &str) -> Result<bool, ArtifactCacheError> {
        let open = self.open()?;
        Ok(self.config.enabled && open.index.lock().entries.contains_key(key))
    }

    /// Removes one artifact. Returns false if it was not cached.
    pub async fn delete(&self, key: &str) -> Result<bool, ArtifactCacheError> {
        let open = self.open()?;
        if !self.config.enabled {
            return Ok(false);
        }

        let _write = self.write_lock.lock().await;
        let existed = open.store.delete(key).await?;
        let indexed = open.index.lock().remove(key).is_some();
        if existed || indexed {
            debug!(key, "Artifact deleted");
        }
        Ok(existed || indexed)
    }

    /// Removes every artifact in `group_key`. Returns how many were removed.
    pub async fn delete_group(&self, group_key: &str) -> Result<usize, ArtifactCacheError> {
        let open = self.open()?;
        if !self.config.enabled {
            return Ok(0);
        }

        let _write = self.write_lock.lock().await;
        let keys = open.index.lock().keys_in_group(group_key);
        for key in &keys {
            open.store.delete(key).await?;
            open.index.lock().remove(key);
        }
        info!(group_key, removed = keys.len(), "Artifact group deleted");
        Ok(keys.len())
    }

    /// Removes every artifact.
    pub async fn clear(&self) -> Result<(), ArtifactCacheError> {
        let open = self.open()?;
        let _write = self.write_lock.lock().await;
        open.store.clear().await?;
        open.index.lock().clear();
        info!("Artifact cache cleared");
        Ok(())
    }

    /// Returns current occupancy.
    pub fn stats(&self) -> Result<CacheStats, ArtifactCacheError> {
        let open = self.open()?;
        let index = open.index.lock();

        let mut entries: Vec<EntryStats> = index
            .entries
            .values()
            .map(|record| EntryStats {
                key: record.key.clone(),
                group_key: record.group_key.clone(),
                size_bytes: record.size_bytes,
                stored_at: record.stored_at,
                last_accessed_at: record.last_accessed_at,
            })
            .collect();
        entries.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then_with(|| a.key.cmp(&b.key))
        });

        Ok(CacheStats {
            total_bytes: index.total_bytes,
            count: entries.len(),
            max_total_bytes: self.config.max_total_bytes,
            entries,
        })
    }

    /// Releases the store. Calls other than `initialize()` then fail with
    /// [`ArtifactCacheError::NotInitialized`].
    pub fn close(&self) {
        if self.state.write().take().is_some() {
            info!("Artifact cache closed");
        }
    }

    fn open(&self) -> Result<Arc<OpenCache>, ArtifactCacheError> {
        self.state
            .read()
            .clone()
            .ok_or(ArtifactCacheError::NotInitialized)
    }

    async fn open_store(&self) -> Result<Arc<dyn ArtifactStore>, ArtifactCacheError> {
        if !self.config.enabled {
            return Ok(Arc::new(MemoryStore::new()));
        }
        match (&self.source, &self.config.backend) {
            (StoreSource::Injected(store), _) => Ok(Arc::clone(store)),
            (StoreSource::Configured, StorageBackend::Memory) => Ok(Arc::new(MemoryStore::new())),
            (StoreSource::Configured, StorageBackend::Directory(root)) => {
                let store = DirectoryStore::open(root.clone()).await.map_err(|e| {
                    ArtifactCacheError::InitializationFailure(format!(
                        "cannot open {}: {}",
                        root.display(),
                        e
                    ))
                })?;
                Ok(Arc::new(store))
            }
        }
    }
}

impl fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("config", &self.config)
            .field("open", &self.is_open())
            .finish()
    }
}
