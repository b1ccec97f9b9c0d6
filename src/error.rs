//! Crate-wide error taxonomy.
//!
//! Each component owns its own error enum; they convert into [`OffloadError`]
//! at the boundary the dispatch surface actually raises, mirroring how the
//! teacher's executor rolled up `SshError`/`K8sError` into one `ExecutorError`.

use thiserror::Error;

use crate::backends::BackendError;
use crate::bundle::PackagingError;
use crate::credentials::CredentialError;
use crate::harvester::HarvestError;
use crate::job::JobId;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("credential resolution failed: {0}")]
    Credential(#[from] CredentialError),

    #[error("bundle packaging failed: {0}")]
    Packaging(#[from] PackagingError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("result harvest failed: {0}")]
    Harvest(#[from] HarvestError),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("submission rejected before dispatch: {0}")]
    SubmissionRejected(String),

    #[error("job {job} failed on the remote side: {message}")]
    RemoteFailure { job: JobId, message: String },

    #[error("job {0} was cancelled")]
    Cancelled(JobId),

    #[error("job {job} exceeded its timeout of {timeout_secs}s")]
    Timeout { job: JobId, timeout_secs: u64 },

    #[error("job {0} result was never observed (lost)")]
    Lost(JobId),

    #[error("result decoding failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
