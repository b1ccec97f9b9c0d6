//! Batch scheduler adapter: SLURM, PBS, SGE, LSF (spec.md §4.7).
//!
//! One adapter, four dialects. Submission renders a launch script with the
//! scheduler's directive header, uploads it alongside the bundle, and submits
//! via the dialect's CLI; probing and cancellation shell out to the matching
//! status/cancel command and map its vocabulary onto [`JobState`].

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::credentials::CredentialBundle;
use crate::job::{BackendHandle, JobSpec, JobState};
use crate::target::TargetKind;
use crate::transport::Transport;

use super::{BackendAdapter, BackendError, ResultLocation};

pub struct BatchAdapter {
    transport: Transport,
    credentials: CredentialBundle,
}

impl BatchAdapter {
    pub fn new(transport: Transport, credentials: CredentialBundle) -> Self {
        Self { transport, credentials }
    }

    fn dialect(kind: TargetKind) -> Dialect {
        match kind {
            TargetKind::Slurm => Dialect::Slurm,
            TargetKind::Pbs => Dialect::Pbs,
            TargetKind::Sge => Dialect::Sge,
            TargetKind::Lsf => Dialect::Lsf,
            _ => unreachable!("BatchAdapter only handles batch scheduler targets"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Dialect {
    Slurm,
    Pbs,
    Sge,
    Lsf,
}

impl Dialect {
    /// Scheduler directive header placed above the bootstrap invocation,
    /// grounded on the `#SBATCH`/`#PBS`/`#$`/`#BSUB` conventions each
    /// scheduler's docs describe for requesting cores/memory/walltime.
    fn render_header(self, spec: &JobSpec, job_name: &str) -> String {
        let cores = spec.resources.cores().ceil() as u32;
        let mem_mb = spec.resources.memory.as_u64() / (1024 * 1024);
        let wall = render_walltime(spec.resources.wall_time);
        let partition = spec
            .resources
            .partition
            .clone()
            .or_else(|| spec.target.default_partition.clone());

        match self {
            Dialect::Slurm => {
                let mut lines = vec![
                    format!("#SBATCH --job-name={job_name}"),
                    format!("#SBATCH --ntasks={}", spec.resources.nodes),
                    format!("#SBATCH --cpus-per-task={cores}"),
                    format!("#SBATCH --mem={mem_mb}M"),
                    format!("#SBATCH --time={wall}"),
                ];
                if let Some(p) = partition {
                    lines.push(format!("#SBATCH --partition={p}"));
                }
                if spec.resources.gpus > 0 {
                    lines.push(format!("#SBATCH --gres=gpu:{}", spec.resources.gpus));
                }
                lines.join("\n")
            }
            Dialect::Pbs => {
                let mut lines = vec![
                    format!("#PBS -N {job_name}"),
                    format!(
                        "#PBS -l nodes={}:ppn={cores}",
                        spec.resources.nodes
                    ),
                    format!("#PBS -l mem={mem_mb}mb"),
                    format!("#PBS -l walltime={wall}"),
                ];
                if let Some(p) = partition {
                    lines.push(format!("#PBS -q {p}"));
                }
                lines.join("\n")
            }
            Dialect::Sge => {
                let mut lines = vec![
                    format!("#$ -N {job_name}"),
                    format!("#$ -pe smp {cores}"),
                    format!("#$ -l h_vmem={mem_mb}M"),
                    format!("#$ -l h_rt={wall}"),
                ];
                if let Some(p) = partition {
                    lines.push(format!("#$ -q {p}"));
                }
                lines.join("\n")
            }
            Dialect::Lsf => {
                let mut lines = vec![
                    format!("#BSUB -J {job_name}"),
                    format!("#BSUB -n {cores}"),
                    format!("#BSUB -M {mem_mb}"),
                    format!("#BSUB -W {}", render_walltime_lsf(spec.resources.wall_time)),
                ];
                if let Some(p) = partition {
                    lines.push(format!("#BSUB -q {p}"));
                }
                lines.join("\n")
            }
        }
    }

    fn submit_command(self, script_path: &str) -> String {
        match self {
            Dialect::Slurm => format!("sbatch --parsable {script_path}"),
            Dialect::Pbs => format!("qsub {script_path}"),
            Dialect::Sge => format!("qsub {script_path}"),
            Dialect::Lsf => format!("bsub < {script_path}"),
        }
    }

    fn status_command(self, job_id: &str) -> String {
        match self {
            Dialect::Slurm => format!("squeue -h -j {job_id} -o %T || sacct -j {job_id} -n -o State -P"),
            Dialect::Pbs => format!("qstat -f {job_id}"),
            Dialect::Sge => format!("qstat -j {job_id}"),
            Dialect::Lsf => format!("bjobs -noheader -o stat {job_id}"),
        }
    }

    fn cancel_command(self, job_id: &str) -> String {
        match self {
            Dialect::Slurm => format!("scancel {job_id}"),
            Dialect::Pbs => format!("qdel {job_id}"),
            Dialect::Sge => format!("qdel {job_id}"),
            Dialect::Lsf => format!("bkill {job_id}"),
        }
    }

    /// Maps scheduler-reported status vocabulary onto the job state machine
    /// (spec.md §4.6). An empty/unparsed status after the job has left the
    /// queue means it went terminal; callers fall back to checking result
    /// files in that case rather than trusting this as `Completed` directly.
    fn parse_status(self, raw: &str) -> JobState {
        let s = raw.trim().to_uppercase();
        if s.is_empty() {
            return JobState::Unknown;
        }
        match self {
            Dialect::Slurm => match s.as_str() {
                "PENDING" | "CONFIGURING" => JobState::Pending,
                "RUNNING" | "COMPLETING" => JobState::Running,
                "COMPLETED" => JobState::Completed,
                "CANCELLED" => JobState::Cancelled,
                "TIMEOUT" => JobState::Timeout,
                "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" => JobState::Failed,
                _ => JobState::Unknown,
            },
            Dialect::Pbs => match s.as_str() {
                "Q" | "H" | "W" => JobState::Pending,
                "R" | "E" => JobState::Running,
                "F" | "C" => JobState::Completed,
                _ => JobState::Unknown,
            },
            Dialect::Sge => match s.as_str() {
                "QW" | "HQW" => JobState::Pending,
                "R" | "T" => JobState::Running,
                "E" | "ERRORED" => JobState::Failed,
                _ => JobState::Unknown,
            },
            Dialect::Lsf => match s.as_str() {
                "PEND" | "PSUSP" => JobState::Pending,
                "RUN" | "USUSP" | "SSUSP" => JobState::Running,
                "DONE" => JobState::Completed,
                "EXIT" => JobState::Failed,
                _ => JobState::Unknown,
            },
        }
    }
}

fn render_walltime(d: Duration) -> String {
    let total = d.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// LSF expresses `-W` in `[hours:]minutes`.
fn render_walltime_lsf(d: Duration) -> String {
    let total_minutes = d.as_secs().div_ceil(60);
    format!("{}:{:02}", total_minutes / 60, total_minutes % 60)
}

#[async_trait]
impl BackendAdapter for BatchAdapter {
    async fn submit(&self, spec: &JobSpec, remote_dir: &str) -> Result<BackendHandle, BackendError> {
        let dialect = Self::dialect(spec.target.kind);
        let job_name = format!("offload-{}", &spec.bundle.id[..8]);
        let mut script = String::from("#!/bin/bash\n");
        script.push_str(&dialect.render_header(spec, &job_name));
        script.push('\n');
        for module in &spec.target.module_loads {
            script.push_str(&format!("module load {module}\n"));
        }
        for (k, v) in &spec.target.environment_overrides {
            script.push_str(&format!("export {k}={}\n", shell_escape::escape(v.into())));
        }
        script.push_str(&format!("export ORIGINAL_CWD={remote_dir}\n"));
        script.push_str(&format!("export OFFLOAD_BACKEND_ID=$({})\n", dialect.job_id_var()));
        script.push_str(&format!("cd {remote_dir}\n"));
        script.push_str("chmod +x bootstrap\n");
        script.push_str("./bootstrap\n");

        let script_path = format!("{remote_dir}/launch.sh");
        self.transport
            .exec(
                &spec.target,
                &self.credentials,
                &format!(
                    "cat > {} <<'OFFLOAD_SCRIPT_EOF'\n{}\nOFFLOAD_SCRIPT_EOF",
                    script_path, script
                ),
                None,
                spec.submission_timeout,
            )
            .await?;

        let result = self
            .transport
            .exec(
                &spec.target,
                &self.credentials,
                &dialect.submit_command(&script_path),
                None,
                spec.submission_timeout,
            )
            .await?;

        if result.exit_code != 0 {
            return Err(BackendError::SubmissionRejected(result.stderr));
        }
        let job_id = extract_job_id(dialect, &result.stdout);
        Ok(BackendHandle::Batch { scheduler_job_id: job_id })
    }

    async fn probe(
        &self,
        spec: &JobSpec,
        handle: &BackendHandle,
        _remote_dir: &str,
    ) -> Result<JobState, BackendError> {
        let BackendHandle::Batch { scheduler_job_id } = handle else {
            return Err(BackendError::ProbeFailed("wrong handle type for batch adapter".into()));
        };
        let dialect = Self::dialect(spec.target.kind);
        let result = self
            .transport
            .exec(
                &spec.target,
                &self.credentials,
                &dialect.status_command(scheduler_job_id),
                None,
                Duration::from_secs(15),
            )
            .await?;
        Ok(dialect.parse_status(&result.stdout))
    }

    async fn cancel(&self, spec: &JobSpec, handle: &BackendHandle) -> Result<(), BackendError> {
        let BackendHandle::Batch { scheduler_job_id } = handle else {
            return Err(BackendError::CancelFailed("wrong handle type".into()));
        };
        let dialect = Self::dialect(spec.target.kind);
        let result = self
            .transport
            .exec(
                &spec.target,
                &self.credentials,
                &dialect.cancel_command(scheduler_job_id),
                None,
                Duration::from_secs(15),
            )
            .await?;
        if result.exit_code != 0 {
            warn!(job_id = %scheduler_job_id, "cancel command returned non-zero, job may have already finished");
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

impl Dialect {
    fn job_id_var(self) -> &'static str {
        match self {
            Dialect::Slurm => "echo $SLURM_JOB_ID",
            Dialect::Pbs => "echo $PBS_JOBID",
            Dialect::Sge => "echo $JOB_ID",
            Dialect::Lsf => "echo $LSB_JOBID",
        }
    }
}

fn extract_job_id(dialect: Dialect, stdout: &str) -> String {
    let trimmed = stdout.trim();
    match dialect {
        Dialect::Slurm => trimmed.split(';').next().unwrap_or(trimmed).to_string(),
        Dialect::Pbs | Dialect::Sge => trimmed
            .split('.')
            .next()
            .unwrap_or(trimmed)
            .to_string(),
        Dialect::Lsf => trimmed
            .split(|c: char| c == '<' || c == '>')
            .nth(1)
            .unwrap_or(trimmed)
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slurm_status_maps_to_job_state() {
        assert_eq!(Dialect::Slurm.parse_status("RUNNING"), JobState::Running);
        assert_eq!(Dialect::Slurm.parse_status("COMPLETED"), JobState::Completed);
        assert_eq!(Dialect::Slurm.parse_status(""), JobState::Unknown);
    }

    #[test]
    fn lsf_job_id_extracted_from_bracket_syntax() {
        assert_eq!(extract_job_id(Dialect::Lsf, "Job <12345> is submitted"), "12345");
    }

    #[test]
    fn slurm_job_id_takes_first_parsable_field() {
        assert_eq!(extract_job_id(Dialect::Slurm, "98765;cluster\n"), "98765");
    }

    #[test]
    fn walltime_renders_as_hh_mm_ss() {
        assert_eq!(render_walltime(Duration::from_secs(3_661)), "01:01:01");
    }
}
