//! Moves requests from the build queue to responses: computes priority, routes to
//! the normal or high-risk path, scores and picks a worker, runs the build, and
//! publishes exactly one response to the request's delivery slot.
//!
//! Grounded on the teacher's `execute_distributed` seam (read registry → filter
//! available → `load_balancer.select_workers` → `execute_on_worker` → aggregate)
//! and its `LoadBalancer` scoring/tie-breaking strategies.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use build_errors::{SchedulerError, SchedulerResult};
use build_types::{
    BuildMetrics, BuildPrediction, BuildRecord, BuildRequest, BuildResponse, BuildStatus, BuildStatusResponse, Worker,
    WorkerStatus,
};
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use prediction_store::PredictionStore;
use tokio::sync::{mpsc, oneshot};

use crate::executor::BuildExecutor;
use crate::metrics::METRICS;
use crate::registry::WorkerRegistry;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub priority_clamp: f64,
    pub fast_path_threshold: f64,
    pub high_risk_threshold: f64,
    /// Delay before each worker-selection attempt; the first entry is the
    /// immediate attempt (0ms), the rest are back-off delays.
    pub retry_backoffs_ms: Vec<u64>,
    /// How long `shutdown()` waits for in-flight builds to drain before closing
    /// remaining response slots with `Cancelled`.
    pub shutdown_grace_period_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            priority_clamp: 10.0,
            fast_path_threshold: 7.0,
            high_risk_threshold: 0.7,
            retry_backoffs_ms: vec![0, 1000, 2000],
            shutdown_grace_period_secs: 30,
        }
    }
}

struct DispatcherInner {
    registry: Arc<WorkerRegistry>,
    predictions: Arc<PredictionStore>,
    executor: Arc<dyn BuildExecutor>,
    config: DispatcherConfig,
    response_slots: DashMap<String, oneshot::Sender<BuildResponse>>,
    status: DashMap<String, BuildStatusResponse>,
    reliability: DashMap<String, (u64, u64)>,
    queue_depth: Arc<AtomicUsize>,
    active_builds: Arc<AtomicUsize>,
    secondary_tx: mpsc::UnboundedSender<(BuildRequest, BuildPrediction)>,
    shutting_down: AtomicBool,
}

/// Thin, cloneable facade over the shared dispatcher state; cloning is an `Arc`
/// bump, the way the teacher's coordinator hands its registry around.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        predictions: Arc<PredictionStore>,
        executor: Arc<dyn BuildExecutor>,
        config: DispatcherConfig,
        queue_depth: Arc<AtomicUsize>,
        active_builds: Arc<AtomicUsize>,
    ) -> (Self, mpsc::Sender<BuildRequest>) {
        let (primary_tx, primary_rx) = mpsc::channel(config.queue_capacity);
        let (secondary_tx, secondary_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(DispatcherInner {
            registry,
            predictions,
            executor,
            config,
            response_slots: DashMap::new(),
            status: DashMap::new(),
            reliability: DashMap::new(),
            queue_depth,
            active_builds,
            secondary_tx,
            shutting_down: AtomicBool::new(false),
        });

        tokio::spawn(Self::route_loop(inner.clone(), primary_rx));
        tokio::spawn(Self::secondary_loop(inner.clone(), secondary_rx));

        (Self { inner }, primary_tx)
    }

    /// Registers a response slot and hands back the matching receiver; the caller
    /// (`CoordinatorHandle`) is expected to `try_send` the request onto the
    /// returned primary-queue sender afterwards.
    pub fn register_slot(&self, request: &BuildRequest) -> oneshot::Receiver<BuildResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner.response_slots.insert(request.request_id.clone(), tx);
        self.inner.status.insert(
            request.request_id.clone(),
            BuildStatusResponse {
                request_id: request.request_id.clone(),
                status: BuildStatus::Queued,
                worker_id: None,
                start_time: None,
                end_time: None,
                duration_secs: None,
                success: None,
                cache_hit_rate: None,
                artifacts: Vec::new(),
                error_message: None,
            },
        );
        rx
    }

    pub fn unregister_slot(&self, request_id: &str) {
        self.inner.response_slots.remove(request_id);
        self.inner.status.remove(request_id);
    }

    pub fn status(&self, request_id: &str) -> SchedulerResult<BuildStatusResponse> {
        self.inner
            .status
            .get(request_id)
            .map(|r| r.clone())
            .ok_or_else(|| SchedulerError::NotFound(request_id.to_string()))
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue_depth.load(Ordering::Relaxed)
    }

    pub fn active_build_count(&self) -> usize {
        self.inner.active_builds.load(Ordering::Relaxed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Relaxed)
    }

    /// Stops accepting new requests (callers should check `is_shutting_down` before
    /// enqueueing) and waits up to `shutdown_grace_period_secs` for in-flight builds
    /// to drain. Anything still queued or dispatching when the grace period elapses
    /// has its response slot closed with `Cancelled`.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Relaxed);

        let grace = Duration::from_secs(self.inner.config.shutdown_grace_period_secs);
        let drained = tokio::time::timeout(grace, async {
            loop {
                if self.inner.active_builds.load(Ordering::Relaxed) == 0 && self.inner.response_slots.is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!("shutdown grace period elapsed with builds still in flight; cancelling remaining slots");
        }

        let pending: Vec<String> = self.inner.response_slots.iter().map(|e| e.key().clone()).collect();
        for request_id in pending {
            if let Some(mut status) = self.inner.status.get_mut(&request_id) {
                status.status = BuildStatus::Cancelled;
                status.error_message = Some(SchedulerError::Cancelled.to_string());
            }
            if let Some((_, sender)) = self.inner.response_slots.remove(&request_id) {
                let _ = sender.send(BuildResponse::failure(request_id, SchedulerError::Cancelled.to_string()));
            }
        }
    }

    async fn route_loop(inner: Arc<DispatcherInner>, mut primary_rx: mpsc::Receiver<BuildRequest>) {
        while let Some(request) = primary_rx.recv().await {
            inner.queue_depth.fetch_sub(1, Ordering::Relaxed);
            let prediction = Self::predict(&inner, &request).await;
            let priority = Self::compute_priority(&inner, &prediction);

            if prediction.failure_risk > inner.config.high_risk_threshold {
                let inner = inner.clone();
                tokio::spawn(async move { Self::dispatch(&inner, request, prediction, true).await });
            } else if priority > inner.config.fast_path_threshold {
                let inner = inner.clone();
                tokio::spawn(async move { Self::dispatch(&inner, request, prediction, false).await });
            } else {
                let _ = inner.secondary_tx.send((request, prediction));
            }
        }
    }

    async fn secondary_loop(
        inner: Arc<DispatcherInner>,
        mut secondary_rx: mpsc::UnboundedReceiver<(BuildRequest, BuildPrediction)>,
    ) {
        while let Some((request, prediction)) = secondary_rx.recv().await {
            Self::dispatch(&inner, request, prediction, false).await;
        }
    }

    async fn predict(inner: &DispatcherInner, request: &BuildRequest) -> BuildPrediction {
        let duration = inner.predictions.predict_duration(&request.project_path, &request.task_name).await;
        let failure_risk = inner.predictions.predict_failure_risk(&request.project_path, &request.task_name).await;
        let cache_hit_rate = inner.predictions.predict_cache_hit_rate(&request.project_path, &request.task_name).await;
        let resource_needs = inner.predictions.predict_resource_needs(&request.project_path, &request.task_name).await;
        BuildPrediction {
            predicted_duration_secs: duration.value,
            duration_confidence: duration.confidence,
            failure_risk,
            cache_hit_rate,
            resource_needs,
        }
    }

    fn compute_priority(inner: &DispatcherInner, prediction: &BuildPrediction) -> f64 {
        let mut priority = 5.0 + 3.0 * prediction.failure_risk;
        if prediction.predicted_duration_secs < 120.0 {
            priority += 2.0;
        }
        if prediction.predicted_duration_secs > 600.0 {
            priority -= 1.0;
        }
        priority += prediction.cache_hit_rate;
        priority.clamp(0.0, inner.config.priority_clamp)
    }

    async fn dispatch(inner: &Arc<DispatcherInner>, request: BuildRequest, prediction: BuildPrediction, high_risk: bool) {
        if let Some(mut status) = inner.status.get_mut(&request.request_id) {
            status.status = BuildStatus::Running;
        }

        match Self::find_worker(inner, &request.task_name, &prediction, high_risk).await {
            Some(worker) => Self::execute_and_respond(inner, worker, request, prediction).await,
            None => {
                Self::deliver_failure(inner, &request.request_id, "No available workers for task".to_string()).await
            }
        }
    }

    async fn find_worker(
        inner: &Arc<DispatcherInner>,
        task: &str,
        prediction: &BuildPrediction,
        high_risk: bool,
    ) -> Option<Worker> {
        for (attempt, backoff_ms) in inner.config.retry_backoffs_ms.iter().enumerate() {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
            }
            let candidates = inner.registry.list_available(task).await;
            if candidates.is_empty() {
                continue;
            }
            let picked = if high_risk {
                Self::score_high_risk(inner, &candidates)
            } else {
                Self::score_normal(&candidates, prediction)
            };
            if picked.is_some() {
                return picked;
            }
        }
        None
    }

    fn score_normal(candidates: &[Worker], prediction: &BuildPrediction) -> Option<Worker> {
        let resource_fit =
            (1.0 - (prediction.resource_needs.cpu - 0.5).abs() - (prediction.resource_needs.memory - 0.5).abs()) / 2.0;
        candidates
            .iter()
            .map(|w| {
                let score = 10.0
                    + 5.0 * resource_fit
                    + 3.0 * prediction.cache_hit_rate
                    + 2.0 * (1.0 - prediction.failure_risk)
                    + if w.build_count > 0 { 1.0 } else { 0.0 };
                (w, score)
            })
            .fold(None::<(&Worker, f64)>, |best, (w, score)| match best {
                None => Some((w, score)),
                Some((bw, bscore)) => {
                    if score > bscore || ((score - bscore).abs() < f64::EPSILON && w.id < bw.id) {
                        Some((w, score))
                    } else {
                        Some((bw, bscore))
                    }
                }
            })
            .map(|(w, _)| w.clone())
    }

    fn score_high_risk(inner: &Arc<DispatcherInner>, candidates: &[Worker]) -> Option<Worker> {
        candidates
            .iter()
            .map(|w| (w, Self::reliability_score(inner, &w.id)))
            .fold(None::<(&Worker, f64)>, |best, (w, score)| match best {
                None => Some((w, score)),
                Some((bw, bscore)) => {
                    if score > bscore || ((score - bscore).abs() < f64::EPSILON && w.id < bw.id) {
                        Some((w, score))
                    } else {
                        Some((bw, bscore))
                    }
                }
            })
            .map(|(w, _)| w.clone())
    }

    fn reliability_score(inner: &Arc<DispatcherInner>, worker_id: &str) -> f64 {
        inner
            .reliability
            .get(worker_id)
            .map(|entry| {
                let (successes, total) = *entry;
                if total == 0 {
                    0.5
                } else {
                    successes as f64 / total as f64
                }
            })
            .unwrap_or(0.5)
    }

    fn record_outcome(inner: &Arc<DispatcherInner>, worker_id: &str, success: bool) {
        inner
            .reliability
            .entry(worker_id.to_string())
            .and_modify(|entry| {
                entry.1 += 1;
                if success {
                    entry.0 += 1;
                }
            })
            .or_insert(if success { (1, 1) } else { (0, 1) });
    }

    async fn execute_and_respond(inner: &Arc<DispatcherInner>, worker: Worker, request: BuildRequest, prediction: BuildPrediction) {
        let _ = inner.registry.update_status(&worker.id, WorkerStatus::Busy).await;
        inner.active_builds.fetch_add(1, Ordering::Relaxed);
        METRICS.active_builds.inc();

        let start = Utc::now();
        let outcome = AssertUnwindSafe(inner.executor.run(&worker, &request)).catch_unwind().await;

        // Flip back to idle on every exit path, including a panicked executor.
        let _ = inner.registry.update_status(&worker.id, WorkerStatus::Idle).await;
        let _ = inner.registry.increment_build_count(&worker.id).await;
        inner.active_builds.fetch_sub(1, Ordering::Relaxed);
        METRICS.active_builds.dec();

        let end = Utc::now();
        let elapsed_secs = (end - start).num_milliseconds() as f64 / 1000.0;

        let (success, error_message, artifacts, cache_files_used) = match outcome {
            Err(_panic) => {
                Self::record_outcome(inner, &worker.id, false);
                (false, Some("internal error: worker task panicked".to_string()), Vec::new(), 0)
            }
            Ok(Err(err)) => {
                Self::record_outcome(inner, &worker.id, false);
                (false, Some(err.to_string()), Vec::new(), 0)
            }
            Ok(Ok(outcome)) if outcome.success => {
                Self::record_outcome(inner, &worker.id, true);
                (true, None, outcome.artifacts, outcome.cache_files_used)
            }
            Ok(Ok(outcome)) => {
                Self::record_outcome(inner, &worker.id, false);
                (false, Some(Self::analyze_failure(&outcome.combined_output)), Vec::new(), outcome.cache_files_used)
            }
        };

        inner
            .predictions
            .record_build(BuildRecord {
                project_path: request.project_path.clone(),
                task_name: request.task_name.clone(),
                worker_id: worker.id.clone(),
                start_time: start,
                end_time: end,
                success,
                cache_hit_rate: prediction.cache_hit_rate,
                cpu: prediction.resource_needs.cpu,
                memory: prediction.resource_needs.memory,
                disk: prediction.resource_needs.disk,
                error_message: error_message.clone(),
            })
            .await;

        if success {
            METRICS.builds_completed.inc();
        } else {
            METRICS.builds_failed.inc();
        }
        METRICS.build_duration_seconds.observe(elapsed_secs);

        let response = BuildResponse {
            request_id: request.request_id.clone(),
            success,
            worker_id: Some(worker.id.clone()),
            duration_secs: elapsed_secs,
            artifacts: artifacts.clone(),
            error_message: error_message.clone(),
            metrics: BuildMetrics {
                cache_hit_rate: prediction.cache_hit_rate,
                cache_files_used,
                artifacts_produced: artifacts.len() as u64,
                predicted_duration_secs: prediction.predicted_duration_secs,
                observed_duration_secs: elapsed_secs,
                predicted_failure_risk: prediction.failure_risk,
            },
        };

        if let Some(mut status) = inner.status.get_mut(&request.request_id) {
            status.status = if success { BuildStatus::Completed } else { BuildStatus::Failed };
            status.worker_id = Some(worker.id.clone());
            status.start_time = Some(start);
            status.end_time = Some(end);
            status.duration_secs = Some(elapsed_secs);
            status.success = Some(success);
            status.cache_hit_rate = Some(prediction.cache_hit_rate);
            status.artifacts = artifacts;
            status.error_message = error_message;
        }

        Self::deliver(inner, &request.request_id, response);
    }

    /// Scans build output for known failure markers; used only on non-zero exit.
    fn analyze_failure(output: &str) -> String {
        let lower = output.to_lowercase();
        if lower.contains("outofmemory") || lower.contains("oom") {
            "out of memory".to_string()
        } else if lower.contains("error[e") || lower.contains("compile error") {
            "compile error".to_string()
        } else if lower.contains("test failed") || lower.contains("test failure") {
            "test failure".to_string()
        } else if lower.contains("could not resolve") || lower.contains("dependency") {
            "dependency resolution failure".to_string()
        } else {
            "build failed".to_string()
        }
    }

    async fn deliver_failure(inner: &Arc<DispatcherInner>, request_id: &str, message: String) {
        METRICS.builds_failed.inc();
        if let Some(mut status) = inner.status.get_mut(request_id) {
            status.status = BuildStatus::Failed;
            status.success = Some(false);
            status.error_message = Some(message.clone());
        }
        let response = BuildResponse::failure(request_id, message);
        Self::deliver(inner, request_id, response);
    }

    fn deliver(inner: &Arc<DispatcherInner>, request_id: &str, response: BuildResponse) {
        if let Some((_, sender)) = inner.response_slots.remove(request_id) {
            let _ = sender.send(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockBuildExecutor;
    use build_types::{BuildRequest as Req, Worker as W};
    use std::collections::HashSet;

    fn worker(id: &str) -> W {
        let mut caps = HashSet::new();
        caps.insert("build".to_string());
        W::new(id, format!("{id}:9000"), caps)
    }

    async fn new_dispatcher() -> (Dispatcher, mpsc::Sender<BuildRequest>, Arc<WorkerRegistry>) {
        let registry = Arc::new(WorkerRegistry::new(10));
        let predictions = Arc::new(PredictionStore::new(Default::default()));
        let executor: Arc<dyn BuildExecutor> = Arc::new(MockBuildExecutor);
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let active_builds = Arc::new(AtomicUsize::new(0));
        let (dispatcher, primary_tx) =
            Dispatcher::new(registry.clone(), predictions, executor, DispatcherConfig::default(), queue_depth, active_builds);
        (dispatcher, primary_tx, registry)
    }

    #[tokio::test]
    async fn happy_path_delivers_success() {
        let (dispatcher, primary_tx, registry) = new_dispatcher().await;
        registry.add(worker("w1")).await.unwrap();

        let request = Req::new("r1", "/a", "build");
        let rx = dispatcher.register_slot(&request);
        dispatcher.inner.queue_depth.fetch_add(1, Ordering::Relaxed);
        primary_tx.send(request).await.unwrap();

        let response = rx.await.unwrap();
        assert!(response.success);
        assert_eq!(response.worker_id, Some("w1".to_string()));
        assert_eq!(response.request_id, "r1");
    }

    #[tokio::test]
    async fn high_risk_scoring_prefers_the_more_reliable_worker() {
        let (_dispatcher, _primary_tx, _registry) = new_dispatcher().await;
        let inner = Arc::new(DispatcherInner {
            registry: Arc::new(WorkerRegistry::new(10)),
            predictions: Arc::new(PredictionStore::new(Default::default())),
            executor: Arc::new(MockBuildExecutor),
            config: DispatcherConfig::default(),
            response_slots: DashMap::new(),
            status: DashMap::new(),
            reliability: DashMap::new(),
            queue_depth: Arc::new(AtomicUsize::new(0)),
            active_builds: Arc::new(AtomicUsize::new(0)),
            secondary_tx: mpsc::unbounded_channel().0,
        });

        Dispatcher::record_outcome(&inner, "reliable", true);
        Dispatcher::record_outcome(&inner, "reliable", true);
        Dispatcher::record_outcome(&inner, "reliable", true);
        Dispatcher::record_outcome(&inner, "flaky", false);
        Dispatcher::record_outcome(&inner, "flaky", true);

        let candidates = vec![worker("flaky"), worker("reliable")];
        let picked = Dispatcher::score_high_risk(&inner, &candidates).unwrap();
        assert_eq!(picked.id, "reliable");
    }

    #[tokio::test]
    async fn shutdown_cancels_slots_still_pending_after_the_grace_period() {
        let registry = Arc::new(WorkerRegistry::new(10));
        let predictions = Arc::new(PredictionStore::new(Default::default()));
        let executor: Arc<dyn BuildExecutor> = Arc::new(MockBuildExecutor);
        let config = DispatcherConfig { shutdown_grace_period_secs: 0, ..DispatcherConfig::default() };
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let active_builds = Arc::new(AtomicUsize::new(0));
        let (dispatcher, _primary_tx) =
            Dispatcher::new(registry, predictions, executor, config, queue_depth, active_builds);

        // Register a slot but never enqueue the matching request, simulating a build
        // still in flight when shutdown is triggered.
        let request = Req::new("r-shutdown", "/a", "build");
        let rx = dispatcher.register_slot(&request);

        dispatcher.shutdown().await;
        assert!(dispatcher.is_shutting_down());

        let response = rx.await.unwrap();
        assert!(!response.success);
        assert_eq!(response.error_message.unwrap(), SchedulerError::Cancelled.to_string());
    }

    #[tokio::test]
    async fn no_worker_available_fails_with_message() {
        let (dispatcher, primary_tx, _registry) = new_dispatcher().await;

        let request = Req::new("r2", "/a", "build");
        let rx = dispatcher.register_slot(&request);
        primary_tx.send(request).await.unwrap();

        let response = rx.await.unwrap();
        assert!(!response.success);
        assert!(response.error_message.unwrap().contains("No available workers"));
    }
}
