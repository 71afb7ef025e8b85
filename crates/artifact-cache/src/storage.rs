//! Storage backends satisfying the `CacheStorage` capability: in-memory (`dashmap`)
//! and filesystem (one `.cache` file per key). `ArtifactCache` is backend-agnostic;
//! it only ever calls through this trait.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use build_errors::SchedulerResult;
use dashmap::DashMap;

use crate::CacheRecord;

/// Backing store for cache records. Implementations own persistence; `ArtifactCache`
/// owns TTL/eviction policy on top.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn get(&self, key: &str) -> SchedulerResult<Option<CacheRecord>>;
    async fn put(&self, key: &str, record: CacheRecord) -> SchedulerResult<()>;
    async fn delete(&self, key: &str) -> SchedulerResult<()>;
    async fn list(&self) -> SchedulerResult<Vec<String>>;
    /// Total bytes of raw payload data across all stored records.
    async fn size(&self) -> SchedulerResult<u64>;
    /// Backend-specific maintenance hook (e.g. pruning unrecognized files). A no-op
    /// is a valid implementation; TTL/eviction live in `ArtifactCache`, not here.
    async fn cleanup(&self) -> SchedulerResult<()>;
}

/// In-memory backend over a concurrent map, the default for tests and for
/// deployments that accept losing the cache across restarts (the specification
/// treats persistent coordinator state as out of scope).
#[derive(Default)]
pub struct MemoryStorage {
    entries: DashMap<String, CacheRecord>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn get(&self, key: &str) -> SchedulerResult<Option<CacheRecord>> {
        Ok(self.entries.get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, key: &str, record: CacheRecord) -> SchedulerResult<()> {
        self.entries.insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> SchedulerResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self) -> SchedulerResult<Vec<String>> {
        Ok(self.entries.iter().map(|r| r.key().clone()).collect())
    }

    async fn size(&self) -> SchedulerResult<u64> {
        Ok(self.entries.iter().map(|r| r.value().data.len() as u64).sum())
    }

    async fn cleanup(&self) -> SchedulerResult<()> {
        Ok(())
    }
}

/// Filesystem backend: one file per key, basename `{url-safe-key}.cache`, contents
/// the JSON-encoded `CacheRecord`. Expiration is always computed from the record's
/// own fields, never from file mtime. Files without the `.cache` suffix are ignored
/// by `list`/`size`.
pub struct FileStorage {
    base_dir: PathBuf,
}

impl FileStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.cache", url_safe_encode(key)))
    }

    async fn ensure_dir(&self) -> SchedulerResult<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        Ok(())
    }

    async fn read_record(path: &Path) -> SchedulerResult<CacheRecord> {
        let bytes = tokio::fs::read(path).await?;
        let record: CacheRecord = serde_json::from_slice(&bytes)?;
        Ok(record)
    }
}

#[async_trait]
impl CacheStorage for FileStorage {
    async fn get(&self, key: &str) -> SchedulerResult<Option<CacheRecord>> {
        let path = self.path_for(key);
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(Some(Self::read_record(&path).await?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, key: &str, record: CacheRecord) -> SchedulerResult<()> {
        self.ensure_dir().await?;
        let path = self.path_for(key);
        let bytes = serde_json::to_vec(&record)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> SchedulerResult<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self) -> SchedulerResult<Vec<String>> {
        self.ensure_dir().await?;
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("cache") {
                continue;
            }
            if let Ok(record) = Self::read_record(&path).await {
                keys.push(record.key);
            }
        }
        Ok(keys)
    }

    async fn size(&self) -> SchedulerResult<u64> {
        self.ensure_dir().await?;
        let mut total = 0u64;
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("cache") {
                continue;
            }
            if let Ok(record) = Self::read_record(&path).await {
                total += record.data.len() as u64;
            }
        }
        Ok(total)
    }

    async fn cleanup(&self) -> SchedulerResult<()> {
        Ok(())
    }
}

/// Filesystem-safe encoding for cache keys: alphanumerics, `-`, and `_` pass through
/// unchanged; everything else becomes `%` followed by two hex digits.
fn url_safe_encode(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push_str(&format!("{byte:02x}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record(key: &str, data: &[u8]) -> CacheRecord {
        CacheRecord {
            key: key.to_string(),
            data: data.to_vec(),
            timestamp: chrono::Utc::now(),
            ttl_secs: 3600,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn memory_storage_round_trips() {
        let storage = MemoryStorage::new();
        storage.put("k1", record("k1", b"payload")).await.unwrap();
        let fetched = storage.get("k1").await.unwrap().unwrap();
        assert_eq!(fetched.data, b"payload");
        assert_eq!(storage.size().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn file_storage_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.put("weird/key:1", record("weird/key:1", b"abc")).await.unwrap();

        let fetched = storage.get("weird/key:1").await.unwrap().unwrap();
        assert_eq!(fetched.data, b"abc");

        let keys = storage.list().await.unwrap();
        assert_eq!(keys, vec!["weird/key:1".to_string()]);
        assert_eq!(storage.size().await.unwrap(), 3);

        storage.delete("weird/key:1").await.unwrap();
        assert!(storage.get("weird/key:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_storage_ignores_unrecognized_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("stray.txt"), b"not a cache record").await.unwrap();
        let storage = FileStorage::new(dir.path());
        assert_eq!(storage.list().await.unwrap().len(), 0);
        assert_eq!(storage.size().await.unwrap(), 0);
    }
}
