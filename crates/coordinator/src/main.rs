//! Thin binary wiring the library crates together. There is no HTTP server here —
//! the FrontDoor and cache HTTP surface are out of scope (spec.md §1/§6) — so this
//! exists to construct the collaborators, run the background loops, and demonstrate
//! the system end to end with a small synthetic workload.

mod config;

use std::collections::HashSet;
use std::sync::Arc;

use artifact_cache::{ArtifactCache, MemoryStorage};
use build_scheduler::{CoordinatorHandle, MockBuildExecutor, WorkerRegistry};
use build_types::{SubmitBuildRequest, Worker};
use prediction_store::PredictionStore;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::config::SchedulerConfig;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = SchedulerConfig::from_env();
    tracing::info!(max_workers = config.max_workers, "starting build orchestrator coordinator");

    let registry = Arc::new(WorkerRegistry::new(config.max_workers));
    let predictions = Arc::new(PredictionStore::new(config.prediction));
    let cache = Arc::new(ArtifactCache::new(Arc::new(MemoryStorage::new()), predictions.clone(), config.cache));
    let executor = Arc::new(MockBuildExecutor);

    let coordinator = CoordinatorHandle::new(registry.clone(), predictions.clone(), executor, config.dispatcher);

    for id in ["w1", "w2"] {
        let mut capabilities = HashSet::new();
        capabilities.insert("build".to_string());
        if let Err(err) = registry.add(Worker::new(id, format!("{id}.local:9000"), capabilities)).await {
            tracing::error!(%err, worker = id, "failed to register seed worker during startup");
            std::process::exit(1);
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let autoscaler = Arc::new(build_scheduler::Autoscaler::new(
        registry.clone(),
        predictions.clone(),
        coordinator.queue_depth_handle(),
    ));
    tokio::spawn(autoscaler.run(config.autoscaler_interval_secs, shutdown_rx.clone()));

    let cleanup_cache = cache.clone();
    let cleanup_interval = config.cache.cleanup_interval_secs;
    let mut cleanup_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(cleanup_interval.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match cleanup_cache.cleanup().await {
                        Ok(()) => {
                            let metrics = cleanup_cache.metrics_snapshot().await;
                            build_scheduler::metrics::METRICS.cache_evictions.set(metrics.evictions as f64);
                        }
                        Err(err) => tracing::warn!(%err, "cache cleanup pass reported an error"),
                    }
                }
                _ = cleanup_shutdown.changed() => {
                    if *cleanup_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let retraining_predictions = predictions.clone();
    let retraining_interval = config.prediction.retraining_interval_secs;
    let mut retraining_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(retraining_interval.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let version = retraining_predictions.retrain().await;
                    tracing::info!(version, "prediction model retrain pass completed");
                }
                _ = retraining_shutdown.changed() => {
                    if *retraining_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    for i in 0..3 {
        let request_id = format!("demo-{i}");
        match coordinator
            .submit(SubmitBuildRequest {
                project_path: "/demo/project".to_string(),
                task_name: "build".to_string(),
                worker_id: None,
                cache_enabled: true,
                build_options: None,
                request_id: Some(request_id.clone()),
            })
            .await
        {
            Ok(build_id) => tracing::info!(build_id, "submitted demo build"),
            Err(err) => tracing::warn!(%err, request_id, "demo build submission failed"),
        }
    }

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let status = coordinator.system_status().await;
    tracing::info!(?status, "coordinator demo workload settled");

    tracing::info!("shutting down: draining in-flight builds");
    coordinator.shutdown().await;
    let _ = shutdown_tx.send(true);
}
