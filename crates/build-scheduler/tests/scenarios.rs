//! End-to-end scenario tests exercising `CoordinatorHandle` as an external caller
//! would: submit, then poll status. Mirrors the worked examples of the system's
//! testable properties (queue back-pressure, no-worker failure).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use build_scheduler::{CoordinatorHandle, DispatcherConfig, MockBuildExecutor, WorkerRegistry};
use build_types::{SubmitBuildRequest, Worker};
use prediction_store::PredictionStore;

fn worker(id: &str) -> Worker {
    let mut caps = HashSet::new();
    caps.insert("gradle".to_string());
    Worker::new(id, format!("{id}:9000"), caps)
}

fn submit_req(id: &str) -> SubmitBuildRequest {
    SubmitBuildRequest {
        project_path: "/a".to_string(),
        task_name: "build".to_string(),
        worker_id: None,
        cache_enabled: true,
        build_options: None,
        request_id: Some(id.to_string()),
    }
}

#[tokio::test]
async fn e3_queue_full_rejects_while_at_capacity() {
    let registry = Arc::new(WorkerRegistry::new(10));
    let predictions = Arc::new(PredictionStore::new(Default::default()));
    let executor = Arc::new(MockBuildExecutor);
    let config = DispatcherConfig { queue_capacity: 1, ..Default::default() };
    let coordinator = CoordinatorHandle::new(registry, predictions, executor, config);

    coordinator.submit(submit_req("r3")).await.unwrap();
    let err = coordinator.submit(submit_req("r4")).await.unwrap_err();
    assert!(matches!(err, build_errors::SchedulerError::QueueFull));
}

#[tokio::test]
async fn e1_happy_path_completes_on_the_registered_worker() {
    let registry = Arc::new(WorkerRegistry::new(10));
    registry.add(worker("w1")).await.unwrap();
    let predictions = Arc::new(PredictionStore::new(Default::default()));
    let executor = Arc::new(MockBuildExecutor);
    let coordinator = CoordinatorHandle::new(registry, predictions, executor, DispatcherConfig::default());

    coordinator.submit(submit_req("r1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = coordinator.get_status("r1").unwrap();
    assert_eq!(status.success, Some(true));
    assert_eq!(status.worker_id, Some("w1".to_string()));
}
