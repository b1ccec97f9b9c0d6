//! Plain SSH backend adapter (spec.md §4.7): no scheduler, no orchestrator —
//! the bootstrap runs as a detached remote process and liveness is a PID
//! check, the way the teacher's `ssh.rs::execute_remote` runs one-shot
//! commands over a pooled session.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::credentials::CredentialBundle;
use crate::job::{BackendHandle, JobSpec, JobState};
use crate::transport::Transport;

use super::{BackendAdapter, BackendError, ResultLocation};

pub struct SshAdapter {
    transport: Transport,
    credentials: CredentialBundle,
}

impl SshAdapter {
    pub fn new(transport: Transport, credentials: CredentialBundle) -> Self {
        Self { transport, credentials }
    }
}

#[async_trait]
impl BackendAdapter for SshAdapter {
    async fn submit(&self, spec: &JobSpec, remote_dir: &str) -> Result<BackendHandle, BackendError> {
        let mut env_prefix = String::new();
        for (k, v) in &spec.target.environment_overrides {
            env_prefix.push_str(&format!("export {k}={}; ", shell_escape::escape(v.into())));
        }
        let command = format!(
            "cd {remote_dir} && chmod +x bootstrap && {env_prefix}ORIGINAL_CWD={remote_dir} OFFLOAD_BACKEND_ID=ssh \
             nohup ./bootstrap > stdout.log 2> stderr.log < /dev/null & echo $!"
        );
        let result = self
            .transport
            .exec(&spec.target, &self.credentials, &command, None, spec.submission_timeout)
            .await?;
        if result.exit_code != 0 {
            return Err(BackendError::SubmissionRejected(result.stderr));
        }
        let pid = result.stdout.trim().parse::<u32>().ok();
        Ok(BackendHandle::Ssh { pid })
    }

    async fn probe(
        &self,
        spec: &JobSpec,
        handle: &BackendHandle,
        remote_dir: &str,
    ) -> Result<JobState, BackendError> {
        let BackendHandle::Ssh { pid } = handle else {
            return Err(BackendError::ProbeFailed("wrong handle type for ssh adapter".into()));
        };
        let Some(pid) = pid else { return Ok(JobState::Unknown) };

        let result = self
            .transport
            .exec(
                &spec.target,
                &self.credentials,
                &format!("kill -0 {pid} 2>/dev/null && echo alive || echo dead"),
                None,
                Duration::from_secs(10),
            )
            .await?;

        if result.stdout.trim() == "alive" {
            return Ok(JobState::Running);
        }

        let check = self
            .transport
            .exec(
                &spec.target,
                &self.credentials,
                &format!(
                    "test -n \"$(ls {remote_dir}/result_*.json 2>/dev/null)\" && echo ok; \
                     test -n \"$(ls {remote_dir}/error_*.json 2>/dev/null)\" && echo err"
                ),
                None,
                Duration::from_secs(10),
            )
            .await?;
        match check.stdout.trim() {
            "ok" => Ok(JobState::Completed),
            "err" => Ok(JobState::Failed),
            _ => Ok(JobState::Unknown),
        }
    }

    async fn cancel(&self, spec: &JobSpec, handle: &BackendHandle) -> Result<(), BackendError> {
        let BackendHandle::Ssh { pid } = handle else {
            return Err(BackendError::CancelFailed("wrong handle type".into()));
        };
        let Some(pid) = pid else { return Ok(()) };
        let result = self
            .transport
            .exec(
                &spec.target,
                &self.credentials,
                &format!("kill -TERM {pid} 2>/dev/null || true"),
                None,
                Duration::from_secs(10),
            )
            .await?;
        if result.exit_code != 0 {
            warn!(pid, "kill returned non-zero, process likely already gone");
        }
        Ok(())
    }

    async fn stream_error_context(
        &self,
        spec: &JobSpec,
        _handle: &BackendHandle,
        remote_dir: &str,
        max_bytes: usize,
    ) -> Result<String, BackendError> {
        let result = self
            .transport
            .exec(
                &spec.target,
                &self.credentials,
                &format!("tail -c {max_bytes} {remote_dir}/stderr.log 2>/dev/null || true"),
                None,
                Duration::from_secs(15),
            )
            .await;
        Ok(result.map(|r| r.stdout).unwrap_or_default())
    }

    fn result_locations(&self, _handle: &BackendHandle, remote_dir: &str) -> ResultLocation {
        ResultLocation {
            result_path: format!("{remote_dir}/result_*.json"),
            error_path: format!("{remote_dir}/error_*.json"),
            stdout_path: Some(format!("{remote_dir}/stdout.log")),
            stderr_path: Some(format!("{remote_dir}/stderr.log")),
        }
    }

    async fn cleanup(
        &self,
        spec: &JobSpec,
        _handle: &BackendHandle,
        remote_dir: &str,
    ) -> Result<(), BackendError> {
        let _ = self
            .transport
            .exec(
                &spec.target,
                &self.credentials,
                &format!("rm -rf {remote_dir}"),
                None,
                Duration::from_secs(30),
            )
            .await?;
        Ok(())
    }
}
