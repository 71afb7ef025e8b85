//! Prometheus metrics for the dispatcher, built the way the teacher's
//! `DistributedMetrics` is: a struct of registered collectors, built once behind
//! `lazy_static`, exported as text for a `/metrics` scrape endpoint.

use lazy_static::lazy_static;
use prometheus::{register_counter, register_gauge, register_histogram, Counter, Encoder, Gauge, Histogram, TextEncoder};

pub struct DispatchMetrics {
    pub builds_submitted: Counter,
    pub builds_completed: Counter,
    pub builds_failed: Counter,
    pub build_duration_seconds: Histogram,
    pub queue_depth: Gauge,
    pub active_builds: Gauge,
    pub worker_count: Gauge,
    pub cache_evictions: Gauge,
}

impl DispatchMetrics {
    fn new() -> Self {
        Self {
            builds_submitted: register_counter!("builds_submitted_total", "Total build requests accepted").unwrap(),
            builds_completed: register_counter!("builds_completed_total", "Total builds that completed successfully").unwrap(),
            builds_failed: register_counter!("builds_failed_total", "Total builds that completed with failure").unwrap(),
            build_duration_seconds: register_histogram!(
                "build_duration_seconds",
                "Observed end-to-end build duration"
            )
            .unwrap(),
            queue_depth: register_gauge!("queue_depth", "Requests waiting in the primary build queue").unwrap(),
            active_builds: register_gauge!("active_builds", "Builds currently running on a worker").unwrap(),
            worker_count: register_gauge!("worker_count", "Registered workers").unwrap(),
            cache_evictions: register_gauge!("cache_evictions_total", "Artifact cache evictions, lifetime count").unwrap(),
        }
    }

    pub fn export(&self) -> String {
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

lazy_static! {
    pub static ref METRICS: DispatchMetrics = DispatchMetrics::new();
}
