//! On-disk artifact store.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! ├── meta.bin                        bincode map of meta values (schema_version, ...)
//! └── artifacts/
//!     ├── <sha256(key)>.<seq>.bin     payload, one file per write
//!     └── <sha256(key)>.rec           bincode record naming the live payload
//! ```
//!
//! Every file is written to a `.tmp` sibling and renamed into place. A put
//! writes its payload under a fresh name first, so the record rename is the
//! single commit point: until it lands the old record still names the old
//! payload. The superseded payload is removed afterwards, and any payload
//! no record names is an orphan removed at open.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ArtifactStore, BoxFuture, EntryRecord, ProgressFn, WRITE_CHUNK_BYTES};
use crate::cache::error::StoreError;

const ARTIFACTS_DIR: &str = "artifacts";
const META_FILE: &str = "meta.bin";
const PAYLOAD_EXT: &str = "bin";
const RECORD_EXT: &str = "rec";
const TEMP_EXT: &str = "tmp";

/// Record file contents: the entry plus the payload file it points at.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskRecord {
    record: EntryRecord,
    payload: String,
}

/// Artifact store backed by a directory.
pub struct DirectoryStore {
    root: PathBuf,
    artifacts: PathBuf,
    /// Source of payload file suffixes; seeded from the wall clock so names
    /// stay fresh across reopen.
    write_seq: AtomicU64,
    /// Serializes read-modify-write of `meta.bin`.
    meta_lock: Mutex<()>,
}

impl DirectoryStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// Removes leftovers of interrupted writes: temp files, payloads no
    /// record names and records whose payload is gone.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let artifacts = root.join(ARTIFACTS_DIR);
        fs::create_dir_all(&artifacts).await?;

        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let store = Self {
            root,
            artifacts,
            write_seq: AtomicU64::new(seed),
            meta_lock: Mutex::new(()),
        };
        let removed = store.sweep().await?;
        info!(
            root = %store.root.display(),
            removed,
            "Opened artifact directory"
        );
        Ok(store)
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stem(key: &str) -> String {
        let digest = Sha256::digest(key.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.artifacts
            .join(format!("{}.{}", Self::stem(key), RECORD_EXT))
    }

    fn meta_path(&self) -> PathBuf {
        self.root.join(META_FILE)
    }

    /// A payload file name for `key` that differs from `current`.
    fn next_payload_name(&self, key: &str, current: Option<&str>) -> String {
        let stem = Self::stem(key);
        loop {
            let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
            let name = format!("{}.{:016x}.{}", stem, seq, PAYLOAD_EXT);
            if current != Some(name.as_str()) {
                return name;
            }
        }
    }

    /// Resolves the payload a record names, refusing anything that is not a
    /// payload file of the record's own key.
    fn payload_of(&self, disk: &DiskRecord) -> Option<PathBuf> {
        let name = disk.payload.as_str();
        let plain = Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name);
        let owned = name.starts_with(&Self::stem(&disk.record.key))
            && name.ends_with(&format!(".{}", PAYLOAD_EXT));
        (plain && owned).then(|| self.artifacts.join(name))
    }

    async fn sweep(&self) -> Result<usize, StoreError> {
        let mut records = Vec::new();
        let mut payloads = Vec::new();
        let mut temps = Vec::new();

        let mut dir = fs::read_dir(&self.artifacts).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(TEMP_EXT) => temps.push(path),
                Some(PAYLOAD_EXT) => payloads.push(path),
                Some(RECORD_EXT) => records.push(path),
                _ => {}
            }
        }

        let mut removed = 0;
        let mut live = HashSet::new();
        for path in records {
            // Unreadable records are left for scan, which drops them.
            let Ok(Some(disk)) = Self::read_record(&path).await else {
                continue;
            };
            let payload = self.payload_of(&disk);
            let present = match &payload {
                Some(payload) => fs::try_exists(payload).await?,
                None => false,
            };
            match payload.filter(|_| present) {
                Some(payload) => {
                    live.insert(payload);
                }
                None => {
                    debug!(path = %path.display(), "Removing record without payload");
                    remove_if_exists(&path).await?;
                    removed += 1;
                }
            }
        }

        for path in temps
            .into_iter()
            .chain(payloads.into_iter().filter(|p| !live.contains(p)))
        {
            debug!(path = %path.display(), "Removing incomplete cache file");
            remove_if_exists(&path).await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn read_record(path: &Path) -> Result<Option<DiskRecord>, StoreError> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(bincode::deserialize(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, disk: &DiskRecord) -> Result<(), StoreError> {
        let data = bincode::serialize(disk)?;
        write_atomic(&self.record_path(&disk.record.key), &data).await
    }

    /// Reads the record for `key`, treating an undecodable one as absent.
    async fn current_record(&self, key: &str) -> Result<Option<DiskRecord>, StoreError> {
        let path = self.record_path(key);
        match Self::read_record(&path).await {
            Err(StoreError::Encoding(e)) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable cache record");
                Ok(None)
            }
            other => other,
        }
    }

    /// Writes `bytes` to a fresh payload file and returns its path.
    async fn write_payload(
        &self,
        name: &str,
        bytes: &[u8],
        progress: Option<&ProgressFn<'_>>,
    ) -> Result<PathBuf, StoreError> {
        let path = self.artifacts.join(name);
        let temp = temp_path(&path);
        let total = bytes.len() as u64;

        let written = async {
            let mut file = fs::File::create(&temp).await?;
            if bytes.is_empty() {
                if let Some(progress) = progress {
                    progress(0, 0);
                }
            }
            let mut written = 0u64;
            for chunk in bytes.chunks(WRITE_CHUNK_BYTES) {
                file.write_all(chunk).await?;
                written += chunk.len() as u64;
                if let Some(progress) = progress {
                    progress(written, total);
                }
            }
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&temp, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(path)
    }

    async fn read_meta(&self) -> Result<HashMap<String, String>, StoreError> {
        match fs::read(self.meta_path()).await {
            Ok(data) => Ok(bincode::deserialize(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl ArtifactStore for DirectoryStore {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>, StoreError>> {
        let key = key.to_string();
        Box::pin(async move {
            let Some(payload) = self
                .current_record(&key)
                .await?
                .and_then(|disk| self.payload_of(&disk))
            else {
                return Ok(None);
            };
            match fs::read(&payload).await {
                Ok(data) => Ok(Some(data)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn put<'a>(
        &'a self,
        record: &'a EntryRecord,
        bytes: &'a [u8],
        progress: Option<&'a ProgressFn<'a>>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let previous = self.current_record(&record.key).await?;
            let name =
                self.next_payload_name(&record.key, previous.as_ref().map(|d| d.payload.as_str()));
            let payload = self.write_payload(&name, bytes, progress).await?;

            let disk = DiskRecord {
                record: record.clone(),
                payload: name,
            };
            if let Err(e) = self.write_record(&disk).await {
                let _ = fs::remove_file(&payload).await;
                return Err(e);
            }

            // Committed; the superseded payload is garbage from here on.
            if let Some(old) = previous.as_ref().and_then(|d| self.payload_of(d)) {
                if let Err(e) = remove_if_exists(&old).await {
                    warn!(path = %old.display(), error = %e, "Failed to remove superseded payload");
                }
            }
            Ok(())
        })
    }

    fn touch(&self, key: &str, accessed_at: u64) -> BoxFuture<'_, Result<bool, StoreError>> {
        let path = self.record_path(key);
        Box::pin(async move {
            let Some(mut disk) = Self::read_record(&path).await? else {
                return Ok(false);
            };
            disk.record.last_accessed_at = accessed_at;
            self.write_record(&disk).await?;
            Ok(true)
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, StoreError>> {
        let key = key.to_string();
        Box::pin(async move {
            let payload = self
                .current_record(&key)
                .await?
                .and_then(|disk| self.payload_of(&disk));
            // Record first: once it is gone the entry no longer exists.
            let existed = remove_if_exists(&self.record_path(&key)).await?;
            if let Some(payload) = payload {
                remove_if_exists(&payload).await?;
            }
            Ok(existed)
        })
    }

    fn scan(&self) -> BoxFuture<'_, Result<Vec<EntryRecord>, StoreError>> {
        Box::pin(async move {
            let mut records = Vec::new();
            let mut dir = fs::read_dir(&self.artifacts).await?;
            while let Some(entry) = dir.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                    continue;
                }

                let disk = match Self::read_record(&path).await {
                    Ok(Some(disk)) => disk,
                    Ok(None) => continue,
                    Err(e) => {
                        // The payload it named is unknown; the next open sweeps it.
                        warn!(path = %path.display(), error = %e, "Dropping unreadable cache record");
                        remove_if_exists(&path).await?;
                        continue;
                    }
                };

                let payload = self.payload_of(&disk);
                let payload_len = match &payload {
                    Some(payload) => match fs::metadata(payload).await {
                        Ok(meta) => Some(meta.len()),
                        Err(e) if e.kind() == ErrorKind::NotFound => None,
                        Err(e) => return Err(e.into()),
                    },
                    None => None,
                };
                if payload_len != Some(disk.record.size_bytes) {
                    warn!(
                        key = %disk.record.key,
                        expected = disk.record.size_bytes,
                        found = ?payload_len,
                        "Dropping cache entry with mismatched payload"
                    );
                    remove_if_exists(&path).await?;
                    if let Some(payload) = payload {
                        remove_if_exists(&payload).await?;
                    }
                    continue;
                }

                records.push(disk.record);
            }
            Ok(records)
        })
    }

    fn clear(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            match fs::remove_dir_all(&self.artifacts).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::create_dir_all(&self.artifacts).await?;
            Ok(())
        })
    }

    fn get_meta(&self, name: &str) -> BoxFuture<'_, Result<Option<String>, StoreError>> {
        let name = name.to_string();
        Box::pin(async move {
            let _guard = self.meta_lock.lock().await;
            Ok(self.read_meta().await?.remove(&name))
        })
    }

    fn put_meta(&self, name: &str, value: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        let name = name.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let _guard = self.meta_lock.lock().await;
            let mut meta = self.read_meta().await?;
            meta.insert(name, value);
            let data = bincode::serialize(&meta)?;
            write_atomic(&self.meta_path(), &data).await
        })
    }

    fn restamp(&self, schema_version: u32) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut count = 0;
            for record in self.scan().await? {
                let Some(mut disk) = self.current_record(&record.key).await? else {
                    continue;
                };
                disk.record.schema_version = schema_version;
                self.write_record(&disk).await?;
                count += 1;
            }
            Ok(count)
        })
    }
}

/// Writes `data` to a temp sibling of `path`, then renames it into place.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let temp = temp_path(path);
    let result = async {
        let mut file = fs::File::create(&temp).await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&temp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

/// `<name>.<ext>.tmp`, so payload and record never share a temp file.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(TEMP_EXT);
    PathBuf::from(name)
}

async fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use tempfile::TempDir;

    fn record(key: &str, size: u64) -> EntryRecord {
        EntryRecord {
            key: key.to_string(),
            group_key: Some("model-a".to_string()),
            size_bytes: size,
            stored_at: 10,
            last_accessed_at: 10,
            schema_version: 1,
        }
    }

    async fn payload_path(store: &DirectoryStore, key: &str) -> PathBuf {
        let disk = store.current_record(key).await.unwrap().unwrap();
        store.payload_of(&disk).unwrap()
    }

    fn payload_files(store: &DirectoryStore) -> Vec<PathBuf> {
        std::fs::read_dir(&store.artifacts)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(PAYLOAD_EXT))
            .collect()
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirectoryStore::open(temp_dir.path()).await.unwrap();

        store.put(&record("weights", 5), b"hello", None).await.unwrap();
        assert_eq!(store.get("weights").await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.get("other").await.unwrap(), None);

        let records = store.scan().await.unwrap();
        assert_eq!(records, vec![record("weights", 5)]);
    }

    #[tokio::test]
    async fn test_files_are_named_by_key_hash() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirectoryStore::open(temp_dir.path()).await.unwrap();
        store.put(&record("../escape", 1), b"x", None).await.unwrap();

        let stem = DirectoryStore::stem("../escape");
        assert_eq!(stem.len(), 64);
        assert!(store.record_path("../escape").exists());

        let payload = payload_path(&store, "../escape").await;
        assert_eq!(payload.parent(), Some(temp_dir.path().join("artifacts").as_path()));
        assert!(payload
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(&stem)));
    }

    #[tokio::test]
    async fn test_put_reports_chunked_progress() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirectoryStore::open(temp_dir.path()).await.unwrap();
        let payload = vec![7u8; WRITE_CHUNK_BYTES * 3 + 1];

        let seen = SyncMutex::new(Vec::new());
        let sink = |written: u64, total: u64| seen.lock().push((written, total));
        store
            .put(&record("big", payload.len() as u64), &payload, Some(&sink))
            .await
            .unwrap();

        let seen = seen.into_inner();
        assert_eq!(seen.len(), 4);
        assert_eq!(
            seen.last(),
            Some(&(payload.len() as u64, payload.len() as u64))
        );
    }

    #[tokio::test]
    async fn test_open_sweeps_incomplete_writes() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = DirectoryStore::open(temp_dir.path()).await.unwrap();
            store.put(&record("kept", 1), b"k", None).await.unwrap();
        }
        let artifacts = temp_dir.path().join("artifacts");
        std::fs::write(artifacts.join("deadbeef.tmp"), b"partial").unwrap();
        std::fs::write(artifacts.join("cafebabe.bin"), b"orphan").unwrap();

        let store = DirectoryStore::open(temp_dir.path()).await.unwrap();
        assert!(!artifacts.join("deadbeef.tmp").exists());
        assert!(!artifacts.join("cafebabe.bin").exists());
        assert_eq!(store.scan().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_drops_mismatched_and_corrupt_entries() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirectoryStore::open(temp_dir.path()).await.unwrap();
        store.put(&record("short", 4), b"abcd", None).await.unwrap();
        store.put(&record("corrupt", 1), b"z", None).await.unwrap();

        let short = payload_path(&store, "short").await;
        std::fs::write(&short, b"ab").unwrap();
        std::fs::write(store.record_path("corrupt"), b"\xff").unwrap();

        assert!(store.scan().await.unwrap().is_empty());
        assert!(!short.exists());
        assert!(!store.record_path("corrupt").exists());
    }

    #[tokio::test]
    async fn test_failed_record_write_keeps_previous_entry() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirectoryStore::open(temp_dir.path()).await.unwrap();
        store.put(&record("a", 3), b"abc", None).await.unwrap();

        // A directory squatting on the record's temp name makes the write fail.
        let blocker = temp_path(&store.record_path("a"));
        std::fs::create_dir(&blocker).unwrap();
        assert!(matches!(
            store.put(&record("a", 4), b"defg", None).await,
            Err(StoreError::Io(_))
        ));
        std::fs::remove_dir(&blocker).unwrap();

        assert_eq!(store.get("a").await.unwrap(), Some(b"abc".to_vec()));
        assert_eq!(store.scan().await.unwrap(), vec![record("a", 3)]);
        assert_eq!(payload_files(&store).len(), 1);
    }

    #[tokio::test]
    async fn test_replace_removes_superseded_payload() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirectoryStore::open(temp_dir.path()).await.unwrap();
        store.put(&record("a", 3), b"abc", None).await.unwrap();
        let first = payload_path(&store, "a").await;

        store.put(&record("a", 4), b"defg", None).await.unwrap();
        let second = payload_path(&store, "a").await;

        assert_ne!(first, second);
        assert!(!first.exists());
        assert_eq!(payload_files(&store), vec![second]);
        assert_eq!(store.get("a").await.unwrap(), Some(b"defg".to_vec()));
    }

    #[tokio::test]
    async fn test_open_sweeps_unreferenced_payload_of_live_key() {
        let temp_dir = TempDir::new().unwrap();
        let stray = {
            let store = DirectoryStore::open(temp_dir.path()).await.unwrap();
            store.put(&record("a", 1), b"a", None).await.unwrap();
            let stray = store.artifacts.join(format!(
                "{}.{:016x}.{}",
                DirectoryStore::stem("a"),
                1,
                PAYLOAD_EXT
            ));
            std::fs::write(&stray, b"left behind").unwrap();
            stray
        };

        let store = DirectoryStore::open(temp_dir.path()).await.unwrap();
        assert!(!stray.exists());
        assert_eq!(store.get("a").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_touch_delete_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirectoryStore::open(temp_dir.path()).await.unwrap();
        store.put(&record("a", 1), b"a", None).await.unwrap();
        store.put(&record("b", 1), b"b", None).await.unwrap();

        assert!(store.touch("a", 500).await.unwrap());
        assert!(!store.touch("zzz", 500).await.unwrap());
        let touched = store
            .scan()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.key == "a")
            .unwrap();
        assert_eq!(touched.last_accessed_at, 500);

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());

        store.put_meta("schema_version", "1").await.unwrap();
        store.clear().await.unwrap();
        assert!(store.scan().await.unwrap().is_empty());
        assert_eq!(
            store.get_meta("schema_version").await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_meta_persists_across_open() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = DirectoryStore::open(temp_dir.path()).await.unwrap();
            store.put_meta("schema_version", "3").await.unwrap();
            store.put(&record("a", 1), b"a", None).await.unwrap();
            assert_eq!(store.restamp(3).await.unwrap(), 1);
        }

        let store = DirectoryStore::open(temp_dir.path()).await.unwrap();
        assert_eq!(
            store.get_meta("schema_version").await.unwrap().as_deref(),
            Some("3")
        );
        assert_eq!(store.scan().await.unwrap()[0].schema_version, 3);
    }
}
