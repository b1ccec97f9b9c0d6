//! Backend adapters (spec.md §4.7): the one seam every scheduler-specific
//! detail crosses. The executor drives every backend through this trait and
//! never branches on `AdapterTag` itself.

pub mod batch;
pub mod kubernetes;
pub mod provisioned;
pub mod ssh_backend;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::job::{BackendHandle, JobSpec, JobState};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("submission rejected: {0}")]
    SubmissionRejected(String),
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
    #[error("probe failed: {0}")]
    ProbeFailed(String),
    #[error("cancel failed: {0}")]
    CancelFailed(String),
    #[error("kubernetes error: {0}")]
    Kubernetes(String),
    #[error("provisioning error: {0}")]
    Provisioning(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a job's harvestable artifacts live once it has gone terminal.
pub struct ResultLocation {
    pub result_path: String,
    pub error_path: String,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
}

/// The uniform seam spec.md §4.7 describes: submit/probe/cancel/inspect/
/// locate/cleanup, implemented once per execution substrate.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Submits the job, returning the handle needed to probe/cancel it later.
    /// Must not block past `spec.submission_timeout`.
    async fn submit(&self, spec: &JobSpec, remote_dir: &str) -> Result<BackendHandle, BackendError>;

    /// Polls current backend-observed state. Returns `JobState::Unknown`
    /// rather than erroring when the adapter cannot classify the job this
    /// tick (spec.md §4.6) — only a hard transport failure should error.
    /// `spec` carries the target/dialect context a bare handle can't.
    async fn probe(
        &self,
        spec: &JobSpec,
        handle: &BackendHandle,
        remote_dir: &str,
    ) -> Result<JobState, BackendError>;

    /// Best-effort: cancellation racing a job's own completion is not an
    /// error, just a no-op (spec.md §4.7 edge cases).
    async fn cancel(&self, spec: &JobSpec, handle: &BackendHandle) -> Result<(), BackendError>;

    /// Recent stderr/log tail used to annotate a failure (spec.md §4.8).
    /// Returns an empty string rather than erroring if logs are unavailable.
    async fn stream_error_context(
        &self,
        spec: &JobSpec,
        handle: &BackendHandle,
        remote_dir: &str,
        max_bytes: usize,
    ) -> Result<String, BackendError>;

    /// Where the harvester should look for `result_*.json` / `error_*.json`.
    fn result_locations(&self, handle: &BackendHandle, remote_dir: &str) -> ResultLocation;

    /// Removes backend-side resources (k8s Job object, batch scratch dir,
    /// ssh process group) once the harvester has the artifact in hand.
    async fn cleanup(
        &self,
        spec: &JobSpec,
        handle: &BackendHandle,
        remote_dir: &str,
    ) -> Result<(), BackendError>;
}

pub(crate) const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(15);
