//! Shared data model for the distributed build orchestrator.
//!
//! Kept as a leaf crate with no logic of its own, the way shared-types crates are
//! factored out elsewhere in this codebase: every entity here is a plain serde-derived
//! struct or enum, owned by whichever component mutates it (the worker registry owns
//! `Worker`, the dispatcher owns `BuildRequest`/`BuildResponse`, the prediction store owns
//! `BuildRecord`/`WorkerMetric`/`CacheMetrics`).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A build request accepted by the front door and enqueued for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub request_id: String,
    pub project_path: String,
    pub task_name: String,
    pub cache_enabled: bool,
    pub options: HashMap<String, String>,
    pub submitted_at: DateTime<Utc>,
}

impl BuildRequest {
    pub fn new(request_id: impl Into<String>, project_path: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            project_path: project_path.into(),
            task_name: task_name.into(),
            cache_enabled: true,
            options: HashMap::new(),
            submitted_at: Utc::now(),
        }
    }
}

/// Metrics gathered about a completed (or attempted) build, attached to its response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildMetrics {
    pub cache_hit_rate: f64,
    pub cache_files_used: u64,
    pub artifacts_produced: u64,
    pub predicted_duration_secs: f64,
    pub observed_duration_secs: f64,
    pub predicted_failure_risk: f64,
}

/// The one-shot response delivered to a request's response slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResponse {
    pub request_id: String,
    pub success: bool,
    pub worker_id: Option<String>,
    pub duration_secs: f64,
    pub artifacts: Vec<String>,
    pub error_message: Option<String>,
    pub metrics: BuildMetrics,
}

impl BuildResponse {
    pub fn failure(request_id: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            worker_id: None,
            duration_secs: 0.0,
            artifacts: Vec::new(),
            error_message: Some(error_message.into()),
            metrics: BuildMetrics::default(),
        }
    }
}

/// Wildcard capability token: a worker advertising this can run any task.
pub const WILDCARD_CAPABILITY: &str = "all";

/// `gradle` is a universal capability token: any worker advertising it qualifies for
/// any task, the same way `WILDCARD_CAPABILITY` does.
pub const GRADLE_CAPABILITY: &str = "gradle";

/// Worker lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

/// A registered remote worker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub address: String,
    pub status: WorkerStatus,
    pub capabilities: HashSet<String>,
    pub build_count: u64,
    pub last_checkin: DateTime<Utc>,
}

impl Worker {
    pub fn new(id: impl Into<String>, address: impl Into<String>, capabilities: HashSet<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            status: WorkerStatus::Idle,
            capabilities,
            build_count: 0,
            last_checkin: Utc::now(),
        }
    }

    /// Whether this worker can service the given task name.
    pub fn supports(&self, task: &str) -> bool {
        self.capabilities.contains(GRADLE_CAPABILITY)
            || self.capabilities.contains(task)
            || self.capabilities.contains(WILDCARD_CAPABILITY)
    }
}

/// One completed (or failed) build, appended to the prediction store's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub project_path: String,
    pub task_name: String,
    pub worker_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub success: bool,
    pub cache_hit_rate: f64,
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub error_message: Option<String>,
}

impl BuildRecord {
    pub fn duration_secs(&self) -> f64 {
        ((self.end_time - self.start_time).num_milliseconds() as f64 / 1000.0).max(0.0)
    }
}

/// A periodic worker resource/queue sample, appended to the prediction store's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMetric {
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub active_builds: u32,
    pub queue_length: u32,
    pub response_time_ms: f64,
}

/// Process-lived cache counters, updated on every cache operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub total_bytes: u64,
    pub entry_count: u64,
    pub evictions: u64,
    pub operations: HashMap<String, u64>,
    pub last_cleanup: Option<DateTime<Utc>>,
}

impl CacheMetrics {
    pub fn record_operation(&mut self, op: &str) {
        *self.operations.entry(op.to_string()).or_insert(0) += 1;
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Estimated resource needs produced by `predict_resource_needs`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceNeeds {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

impl Default for ResourceNeeds {
    fn default() -> Self {
        Self { cpu: 0.5, memory: 0.5, disk: 0.3 }
    }
}

/// A value with an attached confidence in `[0, 1]`, the shape every predictor returns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Confident<T> {
    pub value: T,
    pub confidence: f64,
}

/// Aggregated prediction bundle consumed by the dispatcher's priority/routing logic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BuildPrediction {
    pub predicted_duration_secs: f64,
    pub duration_confidence: f64,
    pub failure_risk: f64,
    pub cache_hit_rate: f64,
    pub resource_needs: ResourceNeeds,
}

/// Autoscaler decision emitted once per control-loop tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScalingAction {
    ScaleUp { target_workers: usize, confidence: f64, reason: String },
    ScaleDown { target_workers: usize, confidence: f64, reason: String },
    Maintain { confidence: f64, reason: String },
}

/// Client-observable build status, as served by `get_status` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// `get build status` response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStatusResponse {
    pub request_id: String,
    pub status: BuildStatus,
    pub worker_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub success: Option<bool>,
    pub cache_hit_rate: Option<f64>,
    pub artifacts: Vec<String>,
    pub error_message: Option<String>,
}

/// `submit build` request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBuildRequest {
    pub project_path: String,
    pub task_name: String,
    pub worker_id: Option<String>,
    pub cache_enabled: bool,
    pub build_options: Option<HashMap<String, String>>,
    pub request_id: Option<String>,
}

/// `get system status` response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub timestamp: DateTime<Utc>,
    pub worker_count: usize,
    pub queue_length: usize,
    pub active_builds: usize,
}

/// `health` response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub uptime_secs: u64,
    pub worker_count: usize,
    pub queue_length: usize,
}

/// Synthesizes a request id the way the front door does when none is supplied:
/// `build-<ns-timestamp>`.
pub fn synthesize_request_id(now: DateTime<Utc>) -> String {
    format!("build-{}", now.timestamp_nanos_opt().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_supports_exact_capability() {
        let mut caps = HashSet::new();
        caps.insert("maven".to_string());
        let w = Worker::new("w1", "127.0.0.1:9000", caps);
        assert!(w.supports("maven"));
        assert!(!w.supports("npm"));
    }

    #[test]
    fn worker_supports_wildcard() {
        let mut caps = HashSet::new();
        caps.insert(WILDCARD_CAPABILITY.to_string());
        let w = Worker::new("w1", "127.0.0.1:9000", caps);
        assert!(w.supports("anything"));
    }

    #[test]
    fn worker_with_gradle_capability_supports_any_task() {
        let mut caps = HashSet::new();
        caps.insert(GRADLE_CAPABILITY.to_string());
        let w = Worker::new("w1", "127.0.0.1:9000", caps);
        assert!(w.supports("build"));
        assert!(w.supports("anything"));
    }

    #[test]
    fn cache_metrics_hit_rate() {
        let mut m = CacheMetrics::default();
        m.hits = 3;
        m.misses = 1;
        assert_eq!(m.hit_rate(), 0.75);
    }

    #[test]
    fn cache_metrics_hit_rate_with_no_operations_is_zero() {
        let m = CacheMetrics::default();
        assert_eq!(m.hit_rate(), 0.0);
    }

    #[test]
    fn build_record_duration_is_nonnegative() {
        let now = Utc::now();
        let record = BuildRecord {
            project_path: "/a".into(),
            task_name: "build".into(),
            worker_id: "w1".into(),
            start_time: now,
            end_time: now,
            success: true,
            cache_hit_rate: 0.5,
            cpu: 0.3,
            memory: 0.4,
            disk: 0.1,
            error_message: None,
        };
        assert_eq!(record.duration_secs(), 0.0);
    }
}
