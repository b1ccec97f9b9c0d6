//! Job lifecycle types and the terminal-state machine (spec.md §3, §4.6).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bundle::BundleRef;
use crate::target::{ClusterTarget, ResourceRequest};

/// Opaque handle identifying a job in the executor's registry. Distinct from
/// the backend-assigned id carried in `Job::backend_handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Argument payload, captured literally at dispatch time (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ArgumentPayload {
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

/// Immutable description of one dispatch, built once and never mutated.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub target: ClusterTarget,
    pub resources: ResourceRequest,
    pub bundle: BundleRef,
    pub payload: ArgumentPayload,
    pub submission_timeout: Duration,
    pub poll_interval: Duration,
}

/// Which backend adapter owns a job's `backend_handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterTag {
    Batch,
    Kubernetes,
    Ssh,
    ProvisionedVm,
}

/// States of the job lifecycle DAG (spec.md §4.6):
///
/// ```text
///         submit                                                  success
/// pending ───────► running ─────────────────────────────► completed
///    │                │                                          ▲
///    │                ├──► failed (non-zero exit / exception)    │
///    │                ├──► timeout (exceeded wall clock)         │
///    │                └──► cancelled (user or shutdown)          │
///    └─ submit-error ─► failed                                   │
///                          (unknown resolves to one of ———————————┘ or to failed after grace)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    /// Transient: the adapter couldn't classify the observed state this poll.
    /// Forced to `Failed` after `unknown_grace` consecutive observations.
    Unknown,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Timeout
        )
    }
}

/// Opaque per-adapter submission data, round-tripped through the executor
/// without interpretation.
#[derive(Debug, Clone)]
pub enum BackendHandle {
    Batch { scheduler_job_id: String },
    Kubernetes { job_name: String, namespace: String },
    Ssh { pid: Option<u32> },
    /// Caches the endpoint a `ProvisionedTarget` handed back at submit time,
    /// so probing/cancelling/cleaning up never re-provisions a fresh VM.
    ProvisionedVm {
        host: String,
        username: String,
        teardown_token: String,
        pid: Option<u32>,
    },
}

/// Central runtime record for one in-flight or completed job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    pub spec: JobSpec,
    pub remote_dir: String,
    pub submitted_at: chrono::DateTime<chrono::Utc>,
    pub first_observed_active_at: Option<chrono::DateTime<chrono::Utc>>,
    pub terminal_at: Option<chrono::DateTime<chrono::Utc>>,
    pub backend_handle: Option<BackendHandle>,
    pub adapter: AdapterTag,
    /// Consecutive `Unknown` observations since the last resolved state.
    pub unknown_streak: u32,
    /// Short hash of `(target, resources)`, independent of the bundle id,
    /// carried purely for log correlation.
    pub config_hash: String,
}

impl Job {
    pub fn transition(&mut self, next: JobState, now: chrono::DateTime<chrono::Utc>) {
        if next == JobState::Running && self.first_observed_active_at.is_none() {
            self.first_observed_active_at = Some(now);
        }
        if next.is_terminal() {
            self.terminal_at = Some(now);
        }
        if next == JobState::Unknown {
            self.unknown_streak += 1;
        } else {
            self.unknown_streak = 0;
        }
        self.state = next;
    }
}

/// Terminal outcome of a job (spec.md §3). Exactly one artifact per job at
/// terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ResultArtifact {
    #[serde(rename = "SUCCESS")]
    Success {
        result: serde_json::Value,
        metadata: ResultMetadata,
    },
    #[serde(rename = "ERROR")]
    Failure {
        error_kind: FailureKind,
        message: String,
        remote_traceback: Option<String>,
        captured_stdout: Option<String>,
        captured_stderr: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    RemoteException,
    Lost,
    ArtifactMissing,
    SubmissionRejected,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub hostname: String,
    pub backend_id: String,
    pub interpreter: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_at_set_only_on_terminal_states() {
        let mut job = sample_job();
        let t0 = chrono::Utc::now();
        job.transition(JobState::Running, t0);
        assert!(job.terminal_at.is_none());
        assert_eq!(job.first_observed_active_at, Some(t0));

        let t1 = t0 + chrono::Duration::seconds(5);
        job.transition(JobState::Completed, t1);
        assert_eq!(job.terminal_at, Some(t1));
    }

    #[test]
    fn unknown_streak_resets_on_resolved_observation() {
        let mut job = sample_job();
        let now = chrono::Utc::now();
        job.transition(JobState::Unknown, now);
        job.transition(JobState::Unknown, now);
        assert_eq!(job.unknown_streak, 2);
        job.transition(JobState::Running, now);
        assert_eq!(job.unknown_streak, 0);
    }

    fn sample_job() -> Job {
        Job {
            id: JobId(1),
            state: JobState::Pending,
            spec: JobSpec {
                target: ClusterTarget::local("/work"),
                resources: ResourceRequest::new(
                    1,
                    bytesize::ByteSize::gb(1),
                    Duration::from_secs(60),
                    1,
                )
                .unwrap(),
                bundle: BundleRef {
                    id: "deadbeef".to_string(),
                    archive_path: "/tmp/bundle-deadbeef.zst".into(),
                },
                payload: ArgumentPayload::default(),
                submission_timeout: Duration::from_secs(30),
                poll_interval: Duration::from_secs(2),
            },
            remote_dir: "/work/deadbeef".to_string(),
            submitted_at: chrono::Utc::now(),
            first_observed_active_at: None,
            terminal_at: None,
            backend_handle: None,
            adapter: AdapterTag::Ssh,
            unknown_streak: 0,
            config_hash: "abcd1234".to_string(),
        }
    }
}
