//! Historical-average predictors for the build orchestrator.
//!
//! This is deliberately not machine learning: every `predict_*` call is a weighted
//! average over bounded ring buffers of past observations, guarded by a single
//! `RwLock` the way the teacher's adaptive load balancer guards its per-worker
//! performance history. Predictors are pure with respect to their inputs and the
//! current history; they never mutate state.

use std::collections::{HashMap, VecDeque};

use build_types::{BuildRecord, CacheMetrics, Confident, ResourceNeeds, ScalingAction, WorkerMetric};
use tokio::sync::RwLock;

const MAX_BUILD_RECORDS: usize = 10_000;
const MAX_WORKER_METRICS: usize = 5_000;
const MAX_CACHE_METRICS: usize = 5_000;
const MAX_SNAPSHOTS: usize = 5;

/// Default duration returned when there is no history at all, in seconds.
const DEFAULT_DURATION_SECS: f64 = 300.0;
/// Default failure risk for a (project, task) pair with fewer than 5 observations.
const DEFAULT_FAILURE_RISK: f64 = 0.1;
/// Default cache hit rate when history is too sparse to estimate.
const DEFAULT_CACHE_HIT_RATE: f64 = 0.7;
/// How many of the most recent matching records feed the "recent failure rate" blend.
const RECENT_WINDOW: usize = 10;

/// Tunables that govern retraining cadence and rollback sensitivity. Queue-depth,
/// CPU, and worker-count thresholds for `predict_scaling` are fixed by the
/// specification's formulas rather than configured here.
#[derive(Debug, Clone, Copy)]
pub struct PredictionConfig {
    /// Below this many matching records, several predictors fall back to defaults.
    pub min_data_points: usize,
    /// How often the coordinator is expected to call `retrain`, in seconds.
    pub retraining_interval_secs: u64,
    /// A retrain is rolled back when its accuracy falls more than this far below
    /// the previous snapshot's accuracy.
    pub performance_threshold: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            min_data_points: 5,
            retraining_interval_secs: 300,
            performance_threshold: 0.2,
        }
    }
}

/// A frozen summary of the store's per-key duration model, kept for audit and
/// rollback purposes. Live predictions always read directly from history; a
/// snapshot never gates `predict_duration` or any other predictor. It exists so a
/// periodic retrain can be monitored and rolled back without touching how
/// predictions are actually served.
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    pub version: u64,
    pub accuracy: f64,
    duration_by_key: HashMap<(String, String), (f64, usize)>,
}

struct Inner {
    build_records: VecDeque<BuildRecord>,
    worker_metrics: VecDeque<WorkerMetric>,
    cache_metrics: VecDeque<CacheMetrics>,
    snapshots: VecDeque<ModelSnapshot>,
    next_snapshot_version: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            build_records: VecDeque::new(),
            worker_metrics: VecDeque::new(),
            cache_metrics: VecDeque::new(),
            snapshots: VecDeque::new(),
            next_snapshot_version: 1,
        }
    }

    fn push_bounded<T>(buf: &mut VecDeque<T>, item: T, cap: usize) {
        buf.push_back(item);
        while buf.len() > cap {
            buf.pop_front();
        }
    }
}

/// In-memory history plus the weighted-average predictors computed over it.
pub struct PredictionStore {
    inner: RwLock<Inner>,
    config: PredictionConfig,
}

impl PredictionStore {
    pub fn new(config: PredictionConfig) -> Self {
        Self { inner: RwLock::new(Inner::new()), config }
    }

    pub async fn record_build(&self, record: BuildRecord) {
        let mut inner = self.inner.write().await;
        Inner::push_bounded(&mut inner.build_records, record, MAX_BUILD_RECORDS);
    }

    pub async fn record_worker_metric(&self, metric: WorkerMetric) {
        let mut inner = self.inner.write().await;
        Inner::push_bounded(&mut inner.worker_metrics, metric, MAX_WORKER_METRICS);
    }

    pub async fn record_cache_metric(&self, metric: CacheMetrics) {
        let mut inner = self.inner.write().await;
        Inner::push_bounded(&mut inner.cache_metrics, metric, MAX_CACHE_METRICS);
    }

    /// Number of build records currently held, for tests and diagnostics.
    pub async fn build_record_count(&self) -> usize {
        self.inner.read().await.build_records.len()
    }

    pub async fn predict_duration(&self, project: &str, task: &str) -> Confident<f64> {
        let inner = self.inner.read().await;
        let matching: Vec<&BuildRecord> = inner
            .build_records
            .iter()
            .filter(|r| r.project_path == project && r.task_name == task && r.success)
            .collect();

        if !matching.is_empty() {
            let n = matching.len();
            let avg = matching.iter().map(|r| r.duration_secs()).sum::<f64>() / n as f64;
            return Confident { value: avg, confidence: (n as f64 / 100.0).min(0.9) };
        }

        let all_successful: Vec<&BuildRecord> = inner.build_records.iter().filter(|r| r.success).collect();
        if !all_successful.is_empty() {
            let n = all_successful.len();
            let avg = all_successful.iter().map(|r| r.duration_secs()).sum::<f64>() / n as f64;
            return Confident { value: avg, confidence: (n as f64 / 100.0).min(0.9) };
        }

        let confidence = if inner.build_records.is_empty() { 0.3 } else { 0.5 };
        Confident { value: DEFAULT_DURATION_SECS, confidence }
    }

    pub async fn predict_failure_risk(&self, project: &str, task: &str) -> f64 {
        let inner = self.inner.read().await;
        let matching: Vec<&BuildRecord> = inner
            .build_records
            .iter()
            .filter(|r| r.project_path == project && r.task_name == task)
            .collect();

        let overall = if matching.len() < self.config.min_data_points {
            DEFAULT_FAILURE_RISK
        } else {
            let failures = matching.iter().filter(|r| !r.success).count();
            failures as f64 / matching.len() as f64
        };

        let recent: Vec<&&BuildRecord> = matching.iter().rev().take(RECENT_WINDOW).collect();
        let recent_rate = if recent.is_empty() {
            overall
        } else {
            let failures = recent.iter().filter(|r| !r.success).count();
            failures as f64 / recent.len() as f64
        };

        (0.7 * overall + 0.3 * recent_rate).min(0.95)
    }

    pub async fn predict_cache_hit_rate(&self, project: &str, task: &str) -> f64 {
        let inner = self.inner.read().await;
        let matching: Vec<&BuildRecord> = inner
            .build_records
            .iter()
            .filter(|r| r.project_path == project && r.task_name == task)
            .collect();

        if !matching.is_empty() {
            return matching.iter().map(|r| r.cache_hit_rate).sum::<f64>() / matching.len() as f64;
        }

        if !inner.build_records.is_empty() {
            return inner.build_records.iter().map(|r| r.cache_hit_rate).sum::<f64>() / inner.build_records.len() as f64;
        }

        DEFAULT_CACHE_HIT_RATE
    }

    pub async fn predict_resource_needs(&self, project: &str, task: &str) -> ResourceNeeds {
        let inner = self.inner.read().await;
        let matching: Vec<&BuildRecord> = inner
            .build_records
            .iter()
            .filter(|r| r.project_path == project && r.task_name == task && r.success)
            .collect();

        if matching.is_empty() {
            return ResourceNeeds::default();
        }

        let n = matching.len() as f64;
        ResourceNeeds {
            cpu: matching.iter().map(|r| r.cpu).sum::<f64>() / n,
            memory: matching.iter().map(|r| r.memory).sum::<f64>() / n,
            disk: matching.iter().map(|r| r.disk).sum::<f64>() / n,
        }
    }

    /// Pure function of the three autoscaler inputs; does not read history.
    pub fn predict_scaling(&self, queue_depth: usize, avg_cpu: f64, current_workers: usize) -> ScalingAction {
        if queue_depth > 10 || avg_cpu > 0.9 {
            let target = (queue_depth as f64 / 3.0).ceil() as usize + current_workers;
            return ScalingAction::ScaleUp {
                target_workers: target,
                confidence: 0.8,
                reason: format!(
                    "queue_depth={queue_depth} avg_cpu={avg_cpu:.2} exceeds scale-up thresholds"
                ),
            };
        }

        if queue_depth < 2 && avg_cpu < 0.3 && current_workers > 1 {
            let target = (current_workers - 1).max(1);
            return ScalingAction::ScaleDown {
                target_workers: target,
                confidence: 0.7,
                reason: format!(
                    "queue_depth={queue_depth} avg_cpu={avg_cpu:.2} below scale-down thresholds"
                ),
            };
        }

        ScalingAction::Maintain {
            confidence: 0.6,
            reason: format!("queue_depth={queue_depth} avg_cpu={avg_cpu:.2} workers={current_workers} within band"),
        }
    }

    /// Recomputes the per-key duration model from current history, compares its
    /// accuracy against the most recent snapshot, and rolls back (keeps the
    /// previous snapshot active, discards the new one) if accuracy regressed by
    /// more than `performance_threshold`. Returns the version number that ends up
    /// active after this call.
    pub async fn retrain(&self) -> u64 {
        let mut inner = self.inner.write().await;

        let mut sums: HashMap<(String, String), (f64, usize)> = HashMap::new();
        for record in inner.build_records.iter().filter(|r| r.success) {
            let key = (record.project_path.clone(), record.task_name.clone());
            let entry = sums.entry(key).or_insert((0.0, 0));
            entry.0 += record.duration_secs();
            entry.1 += 1;
        }
        let duration_by_key: HashMap<(String, String), (f64, usize)> =
            sums.into_iter().map(|(k, (total, n))| (k, (total / n as f64, n))).collect();

        let new_accuracy = self.score_accuracy(&inner.build_records, &duration_by_key);

        let previous_accuracy = inner.snapshots.back().map(|s| s.accuracy);
        let version = inner.next_snapshot_version;

        let should_roll_back = previous_accuracy
            .map(|prev| new_accuracy < prev - self.config.performance_threshold)
            .unwrap_or(false);

        if should_roll_back {
            tracing::info!(new_accuracy, ?previous_accuracy, "retrain regressed accuracy, rolling back");
            return inner.snapshots.back().map(|s| s.version).unwrap_or(0);
        }

        inner.next_snapshot_version += 1;
        inner.snapshots.push_back(ModelSnapshot { version, accuracy: new_accuracy, duration_by_key });
        while inner.snapshots.len() > MAX_SNAPSHOTS {
            inner.snapshots.pop_front();
        }
        version
    }

    /// Fraction of recent successful records whose observed duration fell within
    /// 25% of the freshly-computed per-key average; a simple, bounded proxy for
    /// "how good is this model", not a real loss function.
    fn score_accuracy(
        &self,
        records: &VecDeque<BuildRecord>,
        duration_by_key: &HashMap<(String, String), (f64, usize)>,
    ) -> f64 {
        let mut hits = 0usize;
        let mut total = 0usize;
        for record in records.iter().rev().take(200).filter(|r| r.success) {
            let key = (record.project_path.clone(), record.task_name.clone());
            if let Some((avg, _)) = duration_by_key.get(&key) {
                total += 1;
                let observed = record.duration_secs();
                let relative_error = if *avg > 0.0 { (observed - avg).abs() / avg } else { 0.0 };
                if relative_error <= 0.25 {
                    hits += 1;
                }
            }
        }
        if total == 0 {
            0.75
        } else {
            hits as f64 / total as f64
        }
    }

    /// Currently active snapshot, if any retrain has happened.
    pub async fn active_snapshot(&self) -> Option<ModelSnapshot> {
        self.inner.read().await.snapshots.back().cloned()
    }
}

impl Clone for ModelSnapshot {
    fn clone(&self) -> Self {
        Self { version: self.version, accuracy: self.accuracy, duration_by_key: self.duration_by_key.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn record(project: &str, task: &str, duration_secs: i64, success: bool) -> BuildRecord {
        let start = Utc::now();
        BuildRecord {
            project_path: project.to_string(),
            task_name: task.to_string(),
            worker_id: "w1".to_string(),
            start_time: start,
            end_time: start + ChronoDuration::seconds(duration_secs),
            success,
            cache_hit_rate: 0.5,
            cpu: 0.4,
            memory: 0.4,
            disk: 0.2,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn duration_prediction_averages_matching_successes() {
        let store = PredictionStore::new(PredictionConfig::default());
        for _ in 0..20 {
            store.record_build(record("/p", "build", 120, true)).await;
        }

        let prediction = store.predict_duration("/p", "build").await;
        assert!((prediction.value - 120.0).abs() < 1.0);
        assert!(prediction.confidence >= 0.2);
    }

    #[tokio::test]
    async fn duration_prediction_defaults_when_empty() {
        let store = PredictionStore::new(PredictionConfig::default());
        let prediction = store.predict_duration("/p", "build").await;
        assert_eq!(prediction.value, DEFAULT_DURATION_SECS);
        assert_eq!(prediction.confidence, 0.3);
    }

    #[tokio::test]
    async fn failure_risk_defaults_with_sparse_history() {
        let store = PredictionStore::new(PredictionConfig::default());
        store.record_build(record("/p", "build", 10, false)).await;
        let risk = store.predict_failure_risk("/p", "build").await;
        assert!(risk > 0.0 && risk <= 0.95);
    }

    #[tokio::test]
    async fn scaling_decisions_match_the_worked_examples() {
        let store = PredictionStore::new(PredictionConfig::default());

        match store.predict_scaling(15, 0.4, 3) {
            ScalingAction::ScaleUp { target_workers, .. } => assert!(target_workers >= 4),
            other => panic!("expected ScaleUp, got {other:?}"),
        }

        match store.predict_scaling(0, 0.1, 5) {
            ScalingAction::ScaleDown { target_workers, .. } => assert_eq!(target_workers, 4),
            other => panic!("expected ScaleDown, got {other:?}"),
        }

        match store.predict_scaling(2, 0.5, 3) {
            ScalingAction::Maintain { .. } => {}
            other => panic!("expected Maintain, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn build_record_ring_buffer_is_bounded() {
        let store = PredictionStore::new(PredictionConfig::default());
        for i in 0..(MAX_BUILD_RECORDS + 10) {
            store.record_build(record("/p", "build", i as i64 % 60, true)).await;
        }
        assert_eq!(store.build_record_count().await, MAX_BUILD_RECORDS);
    }

    #[tokio::test]
    async fn retrain_bootstraps_a_snapshot() {
        let store = PredictionStore::new(PredictionConfig::default());
        for _ in 0..10 {
            store.record_build(record("/p", "build", 100, true)).await;
        }
        let version = store.retrain().await;
        assert_eq!(version, 1);
        assert!(store.active_snapshot().await.is_some());
    }
}
