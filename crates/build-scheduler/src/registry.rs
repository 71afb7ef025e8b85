//! Thread-safe worker registry. Mirrors the teacher's
//! `Arc<RwLock<HashMap<String, WorkerNode>>>` shape: a single readers-writer lock
//! guards the map, and selection copies candidates out under the read lock before
//! releasing it to score them.

use std::collections::HashMap;

use build_errors::{SchedulerError, SchedulerResult};
use build_types::{Worker, WorkerStatus};
use chrono::Utc;
use tokio::sync::RwLock;

pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Worker>>,
    max_workers: usize,
}

impl WorkerRegistry {
    pub fn new(max_workers: usize) -> Self {
        Self { workers: RwLock::new(HashMap::new()), max_workers }
    }

    pub async fn add(&self, worker: Worker) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        if workers.len() >= self.max_workers {
            return Err(SchedulerError::AtCapacity);
        }
        workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        workers.remove(id).ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        Ok(())
    }

    pub async fn update_status(&self, id: &str, status: WorkerStatus) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers.get_mut(id).ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        worker.status = status;
        worker.last_checkin = Utc::now();
        Ok(())
    }

    pub async fn record_checkin(&self, id: &str) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers.get_mut(id).ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        worker.last_checkin = Utc::now();
        Ok(())
    }

    pub async fn increment_build_count(&self, id: &str) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers.get_mut(id).ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        worker.build_count += 1;
        Ok(())
    }

    /// Returns an arbitrary idle worker with the required capability; candidates'
    /// relative ordering is left to `list_available` for callers that need to
    /// score/tie-break themselves.
    pub async fn pick_available(&self, task: &str) -> SchedulerResult<Worker> {
        let workers = self.workers.read().await;
        workers
            .values()
            .find(|w| w.status == WorkerStatus::Idle && w.supports(task))
            .cloned()
            .ok_or_else(|| SchedulerError::NoAvailableWorker(task.to_string()))
    }

    /// Copies out every idle, capable worker under the read lock, then releases it.
    pub async fn list_available(&self, task: &str) -> Vec<Worker> {
        let workers = self.workers.read().await;
        workers.values().filter(|w| w.status == WorkerStatus::Idle && w.supports(task)).cloned().collect()
    }

    /// A consistent copy of the whole map, safe to iterate without holding any lock.
    pub async fn snapshot(&self) -> Vec<Worker> {
        self.workers.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn worker(id: &str) -> Worker {
        let mut caps = HashSet::new();
        caps.insert("build".to_string());
        Worker::new(id, format!("{id}.local:9000"), caps)
    }

    #[tokio::test]
    async fn add_rejects_past_capacity() {
        let registry = WorkerRegistry::new(1);
        registry.add(worker("w1")).await.unwrap();
        let err = registry.add(worker("w2")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AtCapacity));
    }

    #[tokio::test]
    async fn remove_missing_worker_is_not_found() {
        let registry = WorkerRegistry::new(4);
        let err = registry.remove("missing").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
    }

    #[tokio::test]
    async fn pick_available_requires_capability_match() {
        let registry = WorkerRegistry::new(4);
        registry.add(worker("w1")).await.unwrap();
        assert!(registry.pick_available("build").await.is_ok());
        assert!(registry.pick_available("deploy").await.is_err());
    }

    #[tokio::test]
    async fn build_count_is_monotonic() {
        let registry = WorkerRegistry::new(4);
        registry.add(worker("w1")).await.unwrap();
        registry.increment_build_count("w1").await.unwrap();
        registry.increment_build_count("w1").await.unwrap();
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot[0].build_count, 2);
    }
}
