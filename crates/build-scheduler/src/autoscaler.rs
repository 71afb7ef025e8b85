//! Periodic control loop that samples load and asks `PredictionStore` for a
//! scaling decision. Provisioning itself is out of scope (spec.md's Open
//! Questions note the source only ever logs the action); this stops at recording
//! and returning the `ScalingAction`. The registry may change size under it at any
//! point — `tick` never assumes a stable worker count between calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use build_types::{ScalingAction, WorkerStatus};
use prediction_store::PredictionStore;
use tokio::sync::watch;

use crate::metrics::METRICS;
use crate::registry::WorkerRegistry;

pub struct Autoscaler {
    registry: Arc<WorkerRegistry>,
    predictions: Arc<PredictionStore>,
    queue_depth: Arc<AtomicUsize>,
}

impl Autoscaler {
    pub fn new(registry: Arc<WorkerRegistry>, predictions: Arc<PredictionStore>, queue_depth: Arc<AtomicUsize>) -> Self {
        Self { registry, predictions, queue_depth }
    }

    /// One control-loop iteration: sample, predict, log, return.
    pub async fn tick(&self) -> ScalingAction {
        let workers = self.registry.snapshot().await;
        let current_workers = workers.len().max(1);
        let busy = workers.iter().filter(|w| w.status == WorkerStatus::Busy).count();
        let idle = workers.iter().filter(|w| w.status == WorkerStatus::Idle).count();
        let sampled = busy + idle;
        let avg_cpu = if sampled == 0 {
            0.2
        } else {
            (busy as f64 * 0.8 + idle as f64 * 0.2) / sampled as f64
        };
        let queue_depth = self.queue_depth.load(Ordering::Relaxed);
        METRICS.worker_count.set(current_workers as f64);
        METRICS.queue_depth.set(queue_depth as f64);

        let action = self.predictions.predict_scaling(queue_depth, avg_cpu, current_workers);
        tracing::info!(queue_depth, avg_cpu, current_workers, ?action, "autoscaler tick");
        action
    }

    /// Runs `tick` every `interval_secs` until `shutdown` is signalled.
    pub async fn run(self: Arc<Self>, interval_secs: u64, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use build_types::Worker;

    fn worker(id: &str, status: WorkerStatus) -> Worker {
        let mut caps = HashSet::new();
        caps.insert("build".to_string());
        let mut w = Worker::new(id, format!("{id}:9000"), caps);
        w.status = status;
        w
    }

    #[tokio::test]
    async fn tick_scales_up_under_heavy_queue() {
        let registry = Arc::new(WorkerRegistry::new(10));
        for i in 0..3 {
            registry.add(worker(&format!("w{i}"), WorkerStatus::Idle)).await.unwrap();
        }
        let predictions = Arc::new(PredictionStore::new(Default::default()));
        let queue_depth = Arc::new(AtomicUsize::new(15));
        let autoscaler = Autoscaler::new(registry, predictions, queue_depth);

        match autoscaler.tick().await {
            ScalingAction::ScaleUp { target_workers, .. } => assert!(target_workers >= 4),
            other => panic!("expected ScaleUp, got {other:?}"),
        }
    }
}
