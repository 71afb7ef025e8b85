//! Unified error handling for the distributed build orchestrator.
//!
//! This crate provides the error taxonomy shared by every component of the scheduling
//! and dispatch subsystem: the worker registry, the artifact cache, the dispatcher, and
//! the autoscaler all return `SchedulerResult<T>`.

/// Result type alias used throughout the orchestrator.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors the scheduling and caching core can surface to callers.
///
/// Each variant corresponds to one of the error kinds in the system's error handling
/// design: validation failures never enter the queue, capacity/availability failures are
/// retryable by the caller, and `Internal` always carries a redacted message and is
/// always logged by the caller.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SchedulerError {
    /// Missing/ill-formed field, or dangerous content in project path or task name.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Submission rejected because the build queue is at capacity; caller may retry.
    #[error("queue full")]
    QueueFull,

    /// Unknown request-id, worker-id, or cache key.
    #[error("not found: {0}")]
    NotFound(String),

    /// The worker registry is at `max_workers` capacity.
    #[error("registry at capacity")]
    AtCapacity,

    /// No worker qualified for a request after the retry budget was exhausted.
    #[error("no available worker for task: {0}")]
    NoAvailableWorker(String),

    /// A cache entry was found past its TTL; the entry is deleted before this is returned.
    #[error("cache entry expired")]
    Expired,

    /// A cache put would violate `max_cache_size` even after synchronous cleanup.
    #[error("cache full")]
    Full,

    /// An in-flight build was terminated by shutdown.
    #[error("build cancelled")]
    Cancelled,

    /// Storage I/O failure, a panicked dispatch task, or any other unexpected failure.
    /// Always logged by the caller; the message reaching clients should be redacted.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for SchedulerError {
    fn from(err: std::io::Error) -> Self {
        SchedulerError::Internal(format!("io error: {err}"))
    }
}

impl From<tokio::task::JoinError> for SchedulerError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            SchedulerError::Internal("dispatch task panicked".to_string())
        } else {
            SchedulerError::Cancelled
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Internal(format!("serialization error: {err}"))
    }
}
