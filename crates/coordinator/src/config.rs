//! Environment-overridable configuration, following the teacher pack's plain
//! `std::env::var` + parse convention rather than introducing a config-file format
//! spec.md never calls for.

use std::time::Duration;

use artifact_cache::ArtifactCacheConfig;
use build_scheduler::DispatcherConfig;
use prediction_store::PredictionConfig;

/// Every environment-overridable setting named in spec.md §6, grouped by the
/// sub-config each library crate actually consumes.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub heartbeat_timeout: Duration,
    pub autoscaler_interval_secs: u64,
    pub dispatcher: DispatcherConfig,
    pub cache: ArtifactCacheConfig,
    pub prediction: PredictionConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            heartbeat_timeout: Duration::from_secs(60),
            autoscaler_interval_secs: 30,
            dispatcher: DispatcherConfig::default(),
            cache: ArtifactCacheConfig::default(),
            prediction: PredictionConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Reads overrides from the environment, falling back to `Default::default()`
    /// field-by-field for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_workers: env_usize("MAX_WORKERS", defaults.max_workers),
            heartbeat_timeout: Duration::from_secs(env_u64("HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout.as_secs())),
            autoscaler_interval_secs: env_u64("AUTOSCALER_INTERVAL_SECS", defaults.autoscaler_interval_secs),
            dispatcher: DispatcherConfig {
                queue_capacity: env_usize("QUEUE_SIZE", defaults.dispatcher.queue_capacity),
                shutdown_grace_period_secs: env_u64(
                    "SHUTDOWN_GRACE_PERIOD_SECS",
                    defaults.dispatcher.shutdown_grace_period_secs,
                ),
                ..defaults.dispatcher
            },
            cache: ArtifactCacheConfig {
                max_cache_size_bytes: env_u64("MAX_CACHE_SIZE_BYTES", defaults.cache.max_cache_size_bytes),
                default_ttl_secs: env_i64("CACHE_TTL_SECS", defaults.cache.default_ttl_secs),
                cleanup_interval_secs: env_u64("CACHE_CLEANUP_INTERVAL_SECS", defaults.cache.cleanup_interval_secs),
                ..defaults.cache
            },
            prediction: PredictionConfig {
                min_data_points: env_usize("PREDICTION_MIN_DATA_POINTS", defaults.prediction.min_data_points),
                retraining_interval_secs: env_u64(
                    "PREDICTION_RETRAINING_INTERVAL_SECS",
                    defaults.prediction.retraining_interval_secs,
                ),
                performance_threshold: env_f64("PREDICTION_PERFORMANCE_THRESHOLD", defaults.prediction.performance_threshold),
            },
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
