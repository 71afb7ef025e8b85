//! The remote-invocation seam. Actually running a build tool on a worker is out of
//! scope; `BuildExecutor` is the capability the Dispatcher calls through, so a real
//! RPC client can be slotted in without touching dispatch logic.

use async_trait::async_trait;
use build_errors::SchedulerResult;
use build_types::{BuildRequest, Worker};

/// What a worker reported back for one build attempt.
#[derive(Debug, Clone)]
pub struct RemoteBuildOutcome {
    pub success: bool,
    pub combined_output: String,
    pub elapsed_secs: f64,
    pub artifacts: Vec<String>,
    pub cache_files_used: u64,
}

#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Runs `request` on `worker` and returns its outcome. Errors here are
    /// transport/protocol failures (the RPC itself failed), distinct from a build
    /// that ran and failed, which is represented by `RemoteBuildOutcome::success`.
    async fn run(&self, worker: &Worker, request: &BuildRequest) -> SchedulerResult<RemoteBuildOutcome>;
}

/// Deterministic stand-in used by tests and the demo binary: "succeeds" unless the
/// task name contains `fail`, in which case it returns a failure with a marker the
/// failure-analysis scan recognizes.
pub struct MockBuildExecutor;

#[async_trait]
impl BuildExecutor for MockBuildExecutor {
    async fn run(&self, _worker: &Worker, request: &BuildRequest) -> SchedulerResult<RemoteBuildOutcome> {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        if request.task_name.contains("fail") {
            return Ok(RemoteBuildOutcome {
                success: false,
                combined_output: "error[E0382]: compile error: borrow of moved value".to_string(),
                elapsed_secs: 0.005,
                artifacts: Vec::new(),
                cache_files_used: 0,
            });
        }
        Ok(RemoteBuildOutcome {
            success: true,
            combined_output: "BUILD SUCCESSFUL".to_string(),
            elapsed_secs: 0.005,
            artifacts: vec![format!("{}/target/output.jar", request.project_path)],
            cache_files_used: 3,
        })
    }
}
