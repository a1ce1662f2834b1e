//! In-memory artifact store.
//!
//! Entries live in a `HashMap` behind a `parking_lot::RwLock`. An optional
//! quota makes the store refuse writes the way a full disk would, which
//! the cache reports as a storage fault.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{report_chunks, ArtifactStore, BoxFuture, EntryRecord, ProgressFn};
use crate::cache::error::StoreError;

struct StoredEntry {
    record: EntryRecord,
    bytes: Arc<Vec<u8>>,
}

/// Artifact store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredEntry>>,
    meta: RwLock<HashMap<String, String>>,
    quota: Option<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that rejects writes beyond `quota` total bytes.
    pub fn with_quota(quota: u64) -> Self {
        Self {
            quota: Some(quota),
            ..Self::default()
        }
    }

    /// Total payload bytes held.
    pub fn size_bytes(&self) -> u64 {
        self.entries
            .read()
            .values()
            .map(|entry| entry.bytes.len() as u64)
            .sum()
    }
}

impl ArtifactStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>, StoreError>> {
        let key = key.to_string();
        Box::pin(async move {
            Ok(self
                .entries
                .read()
                .get(&key)
                .map(|entry| entry.bytes.as_ref().clone()))
        })
    }

    fn put<'a>(
        &'a self,
        record: &'a EntryRecord,
        bytes: &'a [u8],
        progress: Option<&'a ProgressFn<'a>>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut entries = self.entries.write();

            if let Some(quota) = self.quota {
                let used: u64 = entries
                    .iter()
                    .filter(|(key, _)| key.as_str() != record.key)
                    .map(|(_, entry)| entry.bytes.len() as u64)
                    .sum();
                let available = quota.saturating_sub(used);
                if bytes.len() as u64 > available {
                    return Err(StoreError::QuotaExceeded {
                        requested: bytes.len() as u64,
                        available,
                    });
                }
            }

            report_chunks(bytes.len(), progress);
            entries.insert(
                record.key.clone(),
                StoredEntry {
                    record: record.clone(),
                    bytes: Arc::new(bytes.to_vec()),
                },
            );
            Ok(())
        })
    }

    fn touch(&self, key: &str, accessed_at: u64) -> BoxFuture<'_, Result<bool, StoreError>> {
        let key = key.to_string();
        Box::pin(async move {
            match self.entries.write().get_mut(&key) {
                Some(entry) => {
                    entry.record.last_accessed_at = accessed_at;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, StoreError>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.entries.write().remove(&key).is_some()) })
    }

    fn scan(&self) -> BoxFuture<'_, Result<Vec<EntryRecord>, StoreError>> {
        Box::pin(async move {
            Ok(self
                .entries
                .read()
                .values()
                .map(|entry| entry.record.clone())
                .collect())
        })
    }

    fn clear(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.entries.write().clear();
            Ok(())
        })
    }

    fn get_meta(&self, name: &str) -> BoxFuture<'_, Result<Option<String>, StoreError>> {
        let name = name.to_string();
        Box::pin(async move { Ok(self.meta.read().get(&name).cloned()) })
    }

    fn put_meta(&self, name: &str, value: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        let name = name.to_string();
        let value = value.to_string();
        Box::pin(async move {
            self.meta.write().insert(name, value);
            Ok(())
        })
    }

    fn restamp(&self, schema_version: u32) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut entries = self.entries.write();
            for entry in entries.values_mut() {
                entry.record.schema_version = schema_version;
            }
            Ok(entries.len() as u64)
        })
    }
}
