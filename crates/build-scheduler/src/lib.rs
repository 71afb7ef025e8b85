//! Scheduling and dispatch core: worker registry, build queue intake, dispatcher,
//! and autoscaler. This crate owns every concurrent collaborator in the build
//! orchestrator except the artifact cache, which is injected as a capability
//! wherever the dispatcher needs cache-derived metrics.

pub mod autoscaler;
pub mod dispatcher;
pub mod executor;
pub mod metrics;
pub mod registry;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use build_errors::{SchedulerError, SchedulerResult};
use build_types::{
    synthesize_request_id, BuildRequest, BuildStatusResponse, HealthStatus, SubmitBuildRequest, SystemStatus, Worker,
};
use chrono::Utc;
use tokio::sync::mpsc;

pub use autoscaler::Autoscaler;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use executor::{BuildExecutor, MockBuildExecutor, RemoteBuildOutcome};
pub use registry::WorkerRegistry;

use prediction_store::PredictionStore;

/// Facade the FrontDoor (out of scope in full, per spec.md §1/§6) would sit in
/// front of: submit/status/list/system-status/health, the five operations spec.md
/// §6 names for the client-facing surface.
pub struct CoordinatorHandle {
    dispatcher: Dispatcher,
    primary_tx: mpsc::Sender<BuildRequest>,
    registry: Arc<WorkerRegistry>,
    queue_depth: Arc<AtomicUsize>,
    active_builds: Arc<AtomicUsize>,
    started_at: chrono::DateTime<Utc>,
}

impl CoordinatorHandle {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        predictions: Arc<PredictionStore>,
        executor: Arc<dyn BuildExecutor>,
        config: DispatcherConfig,
    ) -> Self {
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let active_builds = Arc::new(AtomicUsize::new(0));
        let (dispatcher, primary_tx) = Dispatcher::new(
            registry.clone(),
            predictions,
            executor,
            config,
            queue_depth.clone(),
            active_builds.clone(),
        );
        Self { dispatcher, primary_tx, registry, queue_depth, active_builds, started_at: Utc::now() }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn queue_depth_handle(&self) -> Arc<AtomicUsize> {
        self.queue_depth.clone()
    }

    /// Accepts a submission, synthesizing a request id if the client omitted one.
    /// Returns the accepted `build_id` immediately; the caller polls `get_status`
    /// or awaits the dispatcher's response slot directly for the outcome.
    pub async fn submit(&self, submitted: SubmitBuildRequest) -> SchedulerResult<String> {
        if self.dispatcher.is_shutting_down() {
            return Err(SchedulerError::Cancelled);
        }
        if submitted.project_path.trim().is_empty() || submitted.task_name.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest("project_path and task_name are required".to_string()));
        }
        if contains_dangerous_content(&submitted.project_path) || contains_dangerous_content(&submitted.task_name) {
            return Err(SchedulerError::InvalidRequest(
                "project_path and task_name must not contain path traversal or control characters".to_string(),
            ));
        }

        let request_id = submitted.request_id.clone().unwrap_or_else(|| synthesize_request_id(Utc::now()));
        let mut request = BuildRequest::new(request_id.clone(), submitted.project_path, submitted.task_name);
        request.cache_enabled = submitted.cache_enabled;
        if let Some(options) = submitted.build_options {
            request.options = options;
        }

        let _rx = self.dispatcher.register_slot(&request);
        match self.primary_tx.try_send(request) {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::Relaxed);
                crate::metrics::METRICS.builds_submitted.inc();
                Ok(request_id)
            }
            Err(_) => {
                self.dispatcher.unregister_slot(&request_id);
                Err(SchedulerError::QueueFull)
            }
        }
    }

    pub fn get_status(&self, request_id: &str) -> SchedulerResult<BuildStatusResponse> {
        self.dispatcher.status(request_id)
    }

    pub async fn list_workers(&self) -> Vec<Worker> {
        self.registry.snapshot().await
    }

    pub async fn system_status(&self) -> SystemStatus {
        SystemStatus {
            timestamp: Utc::now(),
            worker_count: self.registry.len().await,
            queue_length: self.dispatcher.queue_depth(),
            active_builds: self.active_builds.load(Ordering::Relaxed),
        }
    }

    pub async fn health(&self) -> HealthStatus {
        HealthStatus {
            status: "ok".to_string(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            worker_count: self.registry.len().await,
            queue_length: self.dispatcher.queue_depth(),
        }
    }

    /// Stops accepting submissions and waits for in-flight builds to drain (or the
    /// configured grace period to elapse) before returning.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}

/// Rejects path traversal (`..`) and raw control characters, the two classes of
/// "dangerous content" a project path or task name could smuggle through to a
/// worker's shell invocation.
fn contains_dangerous_content(value: &str) -> bool {
    value.contains("..") || value.chars().any(|c| c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn worker(id: &str) -> Worker {
        let mut caps = HashSet::new();
        caps.insert("build".to_string());
        Worker::new(id, format!("{id}:9000"), caps)
    }

    #[tokio::test]
    async fn submit_then_status_reports_completion() {
        let registry = Arc::new(WorkerRegistry::new(10));
        registry.add(worker("w1")).await.unwrap();
        let predictions = Arc::new(PredictionStore::new(Default::default()));
        let executor: Arc<dyn BuildExecutor> = Arc::new(MockBuildExecutor);
        let coordinator = CoordinatorHandle::new(registry, predictions, executor, DispatcherConfig::default());

        let build_id = coordinator
            .submit(SubmitBuildRequest {
                project_path: "/a".to_string(),
                task_name: "build".to_string(),
                worker_id: None,
                cache_enabled: true,
                build_options: None,
                request_id: Some("r1".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(build_id, "r1");

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let status = coordinator.get_status("r1").unwrap();
        assert_eq!(status.success, Some(true));
    }

    #[tokio::test]
    async fn submit_rejects_blank_project_path() {
        let registry = Arc::new(WorkerRegistry::new(10));
        let predictions = Arc::new(PredictionStore::new(Default::default()));
        let executor: Arc<dyn BuildExecutor> = Arc::new(MockBuildExecutor);
        let coordinator = CoordinatorHandle::new(registry, predictions, executor, DispatcherConfig::default());

        let err = coordinator
            .submit(SubmitBuildRequest {
                project_path: "".to_string(),
                task_name: "build".to_string(),
                worker_id: None,
                cache_enabled: true,
                build_options: None,
                request_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn submit_rejects_path_traversal_in_project_path() {
        let registry = Arc::new(WorkerRegistry::new(10));
        let predictions = Arc::new(PredictionStore::new(Default::default()));
        let executor: Arc<dyn BuildExecutor> = Arc::new(MockBuildExecutor);
        let coordinator = CoordinatorHandle::new(registry, predictions, executor, DispatcherConfig::default());

        let err = coordinator
            .submit(SubmitBuildRequest {
                project_path: "/a/../../etc/passwd".to_string(),
                task_name: "build".to_string(),
                worker_id: None,
                cache_enabled: true,
                build_options: None,
                request_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn submit_rejects_control_characters_in_task_name() {
        let registry = Arc::new(WorkerRegistry::new(10));
        let predictions = Arc::new(PredictionStore::new(Default::default()));
        let executor: Arc<dyn BuildExecutor> = Arc::new(MockBuildExecutor);
        let coordinator = CoordinatorHandle::new(registry, predictions, executor, DispatcherConfig::default());

        let err = coordinator
            .submit(SubmitBuildRequest {
                project_path: "/a".to_string(),
                task_name: "build\0rm -rf".to_string(),
                worker_id: None,
                cache_enabled: true,
                build_options: None,
                request_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
    }
}
