//! Content-addressed artifact cache with TTL expiry and predictive eviction.
//!
//! Storage is delegated to a `CacheStorage` capability (in-memory or filesystem),
//! the way the teacher's cache crate delegates to a `StorageBackend`. `ArtifactCache`
//! itself only knows about TTL bookkeeping, metrics, and the eviction scoring pass;
//! it never reaches into a backend's internals.

pub mod storage;

use std::collections::HashMap;
use std::sync::Arc;

use build_errors::{SchedulerError, SchedulerResult};
use build_types::CacheMetrics;
use chrono::{DateTime, Utc};
use prediction_store::PredictionStore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub use storage::{CacheStorage, FileStorage, MemoryStorage};

/// Self-describing on-disk/in-memory record: `{key, data, timestamp, ttl, metadata}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: String,
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub ttl_secs: i64,
    pub metadata: HashMap<String, String>,
}

impl CacheRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.timestamp).num_seconds() > self.ttl_secs
    }

    fn recency_factor(&self, now: DateTime<Utc>) -> f64 {
        let hours = (now - self.timestamp).num_seconds().max(0) as f64 / 3600.0;
        1.0 / (1.0 + hours)
    }

    fn size_factor(&self) -> f64 {
        1.0 / (1.0 + self.data.len() as f64)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ArtifactCacheConfig {
    pub max_cache_size_bytes: u64,
    pub default_ttl_secs: i64,
    pub cleanup_interval_secs: u64,
    /// Cleanup triggers predictive eviction once usage crosses this fraction of capacity.
    pub cleanup_trigger_fraction: f64,
    /// Eviction removes entries until usage falls to this fraction of capacity.
    pub eviction_target_fraction: f64,
}

impl Default for ArtifactCacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size_bytes: 10 * 1024 * 1024 * 1024,
            default_ttl_secs: 24 * 60 * 60,
            cleanup_interval_secs: 60 * 60,
            cleanup_trigger_fraction: 0.8,
            eviction_target_fraction: 0.7,
        }
    }
}

/// Storage handle plus metrics, held behind one `RwLock` so that the eviction pass
/// in `cleanup` can take the write half for its entire duration: every other
/// operation (`get`/`put`/`delete`/`list`) also goes through this same lock, so none
/// of them can interleave with a cleanup pass in progress.
struct CacheState {
    storage: Arc<dyn CacheStorage>,
    metrics: CacheMetrics,
}

/// Content-addressed artifact store: TTL expiry, size invariant, predictive eviction.
pub struct ArtifactCache {
    state: RwLock<CacheState>,
    predictions: Arc<PredictionStore>,
    config: ArtifactCacheConfig,
}

impl ArtifactCache {
    pub fn new(storage: Arc<dyn CacheStorage>, predictions: Arc<PredictionStore>, config: ArtifactCacheConfig) -> Self {
        Self { state: RwLock::new(CacheState { storage, metrics: CacheMetrics::default() }), predictions, config }
    }

    /// Fetches an entry's payload bytes. Expired entries are deleted before the
    /// `Expired` error is returned; callers at the HTTP boundary are expected to
    /// map both `NotFound` and `Expired` to a 404.
    pub async fn get(&self, key: &str) -> SchedulerResult<Vec<u8>> {
        let mut state = self.state.write().await;
        state.metrics.record_operation("get");

        let record = state.storage.get(key).await?;
        match record {
            None => {
                state.metrics.misses += 1;
                Err(SchedulerError::NotFound(key.to_string()))
            }
            Some(record) if record.is_expired(Utc::now()) => {
                state.storage.delete(key).await?;
                state.metrics.misses += 1;
                Err(SchedulerError::Expired)
            }
            Some(record) => {
                state.metrics.hits += 1;
                Ok(record.data)
            }
        }
    }

    /// Stores (or overwrites) an entry. Attempts a synchronous TTL sweep before
    /// failing with `Full` if the put would still exceed the configured size bound.
    pub async fn put(&self, key: &str, data: Vec<u8>, metadata: HashMap<String, String>) -> SchedulerResult<()> {
        let mut state = self.state.write().await;
        state.metrics.record_operation("put");

        let existing_len = match state.storage.get(key).await? {
            Some(existing) => existing.data.len() as u64,
            None => 0,
        };
        let current_size = state.storage.size().await?;
        let projected = current_size.saturating_sub(existing_len) + data.len() as u64;

        if projected > self.config.max_cache_size_bytes {
            Self::sweep_expired_locked(&state).await?;
            let current_size = state.storage.size().await?;
            let projected = current_size.saturating_sub(existing_len) + data.len() as u64;
            if projected > self.config.max_cache_size_bytes {
                return Err(SchedulerError::Full);
            }
        }

        let record = CacheRecord {
            key: key.to_string(),
            data,
            timestamp: Utc::now(),
            ttl_secs: self.config.default_ttl_secs,
            metadata,
        };
        state.storage.put(key, record).await?;
        state.metrics.entry_count = state.storage.list().await?.len() as u64;
        state.metrics.total_bytes = state.storage.size().await?;
        Ok(())
    }

    /// Idempotent: succeeds whether or not the key was present.
    pub async fn delete(&self, key: &str) -> SchedulerResult<()> {
        let mut state = self.state.write().await;
        state.metrics.record_operation("delete");
        state.storage.delete(key).await?;
        state.metrics.entry_count = state.storage.list().await?.len() as u64;
        state.metrics.total_bytes = state.storage.size().await?;
        Ok(())
    }

    pub async fn list(&self) -> SchedulerResult<Vec<String>> {
        let mut state = self.state.write().await;
        state.metrics.record_operation("list");
        state.storage.list().await
    }

    pub async fn size(&self) -> SchedulerResult<u64> {
        self.state.write().await.storage.size().await
    }

    pub async fn metrics_snapshot(&self) -> CacheMetrics {
        self.state.write().await.metrics.clone()
    }

    /// Removes every entry whose TTL has elapsed. Pure side effect, no scoring.
    /// Takes `state` already write-locked by the caller, so it never re-enters
    /// the lock itself.
    async fn sweep_expired_locked(state: &CacheState) -> SchedulerResult<()> {
        let now = Utc::now();
        let keys = state.storage.list().await?;
        for key in keys {
            if let Some(record) = state.storage.get(&key).await? {
                if record.is_expired(now) {
                    state.storage.delete(&key).await?;
                }
            }
        }
        Ok(())
    }

    /// Read-only: scores every current entry without deleting or mutating anything.
    /// Entries are ordered ascending by score (least valuable first), the order
    /// `cleanup` evicts in. Exposed separately so scoring can be tested and audited
    /// without triggering deletion, per this cache's separation of "list candidates"
    /// from "evict".
    pub async fn list_for_eviction(&self) -> SchedulerResult<Vec<(String, f64)>> {
        let state = self.state.write().await;
        let now = Utc::now();
        let keys = state.storage.list().await?;
        let mut scored = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = state.storage.get(&key).await? {
                let score = self.score(&record, now).await;
                scored.push((key, score));
            }
        }
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        Ok(scored)
    }

    async fn score(&self, record: &CacheRecord, now: DateTime<Utc>) -> f64 {
        let recency = record.recency_factor(now);
        let (project, task) = match (record.metadata.get("project_path"), record.metadata.get("task_name")) {
            (Some(p), Some(t)) => (p.clone(), t.clone()),
            _ => return recency,
        };
        let predicted_hit_rate = self.predictions.predict_cache_hit_rate(&project, &task).await;
        0.5 * predicted_hit_rate + 0.3 * recency + 0.2 * record.size_factor()
    }

    /// Runs the TTL sweep and, if usage is still at or above the trigger fraction,
    /// the predictive eviction pass, holding the single write lock on `state` for
    /// the whole pass: every `get`/`put`/`delete`/`list` call blocks until this
    /// returns.
    pub async fn cleanup(&self) -> SchedulerResult<()> {
        let mut state = self.state.write().await;
        state.storage.cleanup().await?;
        Self::sweep_expired_locked(&state).await?;

        let capacity = self.config.max_cache_size_bytes as f64;
        let trigger = capacity * self.config.cleanup_trigger_fraction;
        let target = capacity * self.config.eviction_target_fraction;

        let mut current_size = state.storage.size().await? as f64;
        if current_size < trigger {
            state.metrics.last_cleanup = Some(Utc::now());
            return Ok(());
        }

        let now = Utc::now();
        let keys = state.storage.list().await?;
        let mut scored = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = state.storage.get(&key).await? {
                let score = self.score(&record, now).await;
                scored.push((key, score));
            }
        }
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));

        let mut evicted = 0u64;
        for (key, _score) in scored {
            if current_size <= target {
                break;
            }
            if let Some(record) = state.storage.get(&key).await? {
                state.storage.delete(&key).await?;
                current_size -= record.data.len() as f64;
                evicted += 1;
            }
        }

        if evicted > 0 {
            tracing::info!(evicted, size_after = current_size, "predictive eviction pass completed");
        }

        state.metrics.evictions += evicted;
        state.metrics.entry_count = state.storage.list().await?.len() as u64;
        state.metrics.total_bytes = state.storage.size().await?;
        state.metrics.last_cleanup = Some(Utc::now());
        Ok(())
    }
}
