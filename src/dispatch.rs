//! Dispatch Surface (C9, spec.md §4.9).
//!
//! The one type user code touches. Three config layers merge before a call
//! reaches the executor: process-wide defaults set once at `Offload::new`,
//! per-function decoration defaults, and per-call overrides — each layer
//! only fills in what the layer below it left `None`. A `local` target with
//! no async handle requested skips the executor/backend-adapter machinery
//! entirely and just runs the generated bootstrap as a child process, since
//! there is no scheduler round trip to amortize.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::warn;

use crate::bootstrap::{ArgsEnvelope, END_MARKER, ERROR_MARKER, RESULT_MARKER};
use crate::error::OffloadError;
use crate::executor::{Executor, SubmitRequest};
use crate::job::{ArgumentPayload, FailureKind, JobId, JobState, ResultArtifact};
use crate::target::{ClusterTarget, ResourceRequest};

/// Collaborator spec.md §6 describes for installing a missing scheduler CLI
/// or cloud SDK before first use. The core never implements this itself —
/// callers that want it wire in a concrete impl (e.g. shelling out to a
/// package manager). Returning `false` is not fatal: dispatch proceeds and
/// lets the backend itself fail if the tool really is missing.
#[async_trait::async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn ensure(&self, cluster_kind: &str, provider_tag: &str, quiet: bool) -> bool;
}

/// Process-wide defaults, set once when the caller builds an [`Offload`].
#[derive(Clone, Default)]
pub struct DispatchDefaults {
    pub target: Option<ClusterTarget>,
    pub resources: Option<ResourceRequest>,
    pub submission_timeout: Option<Duration>,
    pub poll_interval: Option<Duration>,
    pub interpreter_version: Option<String>,
}

impl DispatchDefaults {
    fn merge(&self, over: &DispatchDefaults) -> DispatchDefaults {
        DispatchDefaults {
            target: over.target.clone().or_else(|| self.target.clone()),
            resources: over.resources.clone().or_else(|| self.resources.clone()),
            submission_timeout: over.submission_timeout.or(self.submission_timeout),
            poll_interval: over.poll_interval.or(self.poll_interval),
            interpreter_version: over
                .interpreter_version
                .clone()
                .or_else(|| self.interpreter_version.clone()),
        }
    }
}

pub struct Offload {
    executor: Arc<Executor>,
    process_defaults: DispatchDefaults,
    installer: Option<Arc<dyn DependencyInstaller>>,
}

impl Offload {
    pub fn new(executor: Arc<Executor>, process_defaults: DispatchDefaults) -> Self {
        Self { executor, process_defaults, installer: None }
    }

    pub fn with_dependency_installer(mut self, installer: Arc<dyn DependencyInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Starts building one dispatch of `function_name`/`function_source`,
    /// pre-seeded with decoration-level defaults (spec.md's "per-decoration"
    /// config layer).
    pub fn task<'a>(&'a self, function_name: &'a str, function_source: &'a str) -> TaskBuilder<'a> {
        TaskBuilder {
            offload: self,
            function_name,
            function_source,
            decoration_defaults: DispatchDefaults::default(),
            overrides: DispatchDefaults::default(),
            payload: ArgumentPayload::default(),
            data_search_roots: Vec::new(),
            local_callee_sources: std::collections::BTreeMap::new(),
            want_async: false,
        }
    }
}

pub struct TaskBuilder<'a> {
    offload: &'a Offload,
    function_name: &'a str,
    function_source: &'a str,
    decoration_defaults: DispatchDefaults,
    overrides: DispatchDefaults,
    payload: ArgumentPayload,
    data_search_roots: Vec<PathBuf>,
    local_callee_sources: std::collections::BTreeMap<String, String>,
    want_async: bool,
}

impl<'a> TaskBuilder<'a> {
    pub fn decoration_defaults(mut self, defaults: DispatchDefaults) -> Self {
        self.decoration_defaults = defaults;
        self
    }

    pub fn target(mut self, target: ClusterTarget) -> Self {
        self.overrides.target = Some(target);
        self
    }

    pub fn resources(mut self, resources: ResourceRequest) -> Self {
        self.overrides.resources = Some(resources);
        self
    }

    pub fn args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.payload.args = args;
        self
    }

    pub fn kwargs(mut self, kwargs: serde_json::Map<String, serde_json::Value>) -> Self {
        self.payload.kwargs = kwargs;
        self
    }

    pub fn data_search_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.data_search_roots = roots;
        self
    }

    /// Supplies the source of a local helper function the captured function
    /// calls, keyed by the name the dependency analyzer reports in
    /// `local_calls`. The analyzer can name a local callee but can't resolve
    /// it to source (it only sees the captured function's own text); callers
    /// that have access to the defining module (e.g. via `func.__globals__`
    /// on the Python side) supply it here so the bundle can embed it.
    pub fn local_callee_source(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.local_callee_sources.insert(name.into(), source.into());
        self
    }

    /// Requests a movable [`JobHandle`] instead of blocking for the result
    /// (spec.md §4.9's asynchronous path).
    pub fn asynchronous(mut self) -> Self {
        self.want_async = true;
        self
    }

    fn effective(&self) -> DispatchDefaults {
        self.offload
            .process_defaults
            .merge(&self.decoration_defaults)
            .merge(&self.overrides)
    }

    /// Submits the job and, unless [`asynchronous`](Self::asynchronous) was
    /// called, blocks for the terminal result.
    pub async fn dispatch(self) -> Result<DispatchOutcome, OffloadError> {
        let effective = self.effective();
        let target = effective.target.clone().unwrap_or_else(|| ClusterTarget::local("/tmp/offload"));
        let resources = effective.resources.clone().ok_or_else(|| {
            OffloadError::SubmissionRejected("no resource request supplied at any config layer".into())
        })?;

        if let Some(installer) = &self.offload.installer {
            let cluster_kind = format!("{:?}", target.kind);
            if !installer.ensure(&cluster_kind, "default", true).await {
                warn!(cluster = %cluster_kind, "dependency installer reported failure, continuing anyway");
            }
        }

        if target.kind == crate::target::TargetKind::Local && !self.want_async {
            let artifact = run_local_in_process(
                self.function_name,
                self.function_source,
                &self.payload,
                &self.local_callee_sources,
            )
            .await?;
            return Ok(DispatchOutcome::Finished(artifact));
        }

        let submission_timeout = effective.submission_timeout.unwrap_or(Duration::from_secs(60));
        let poll_interval = effective.poll_interval.unwrap_or(Duration::from_secs(2));
        let interpreter_version = effective.interpreter_version.unwrap_or_else(|| "3.11".to_string());

        let id = self
            .offload
            .executor
            .submit(SubmitRequest {
                function_name: self.function_name,
                function_source: self.function_source,
                payload: self.payload,
                target,
                resources,
                interpreter_version: &interpreter_version,
                data_search_roots: self.data_search_roots,
                local_callee_sources: self.local_callee_sources,
                submission_timeout,
                poll_interval,
            })
            .await?;

        let handle = JobHandle {
            executor: self.offload.executor.clone(),
            id,
            submitted_at: Instant::now(),
        };

        if self.want_async {
            Ok(DispatchOutcome::Handle(handle))
        } else {
            let artifact = handle.result(None).await?;
            Ok(DispatchOutcome::Finished(artifact))
        }
    }
}

pub enum DispatchOutcome {
    Finished(ResultArtifact),
    Handle(JobHandle),
}

/// Movable, `Send` handle to an in-flight or completed job (spec.md §4.9).
#[derive(Clone)]
pub struct JobHandle {
    executor: Arc<Executor>,
    id: JobId,
    submitted_at: Instant,
}

impl JobHandle {
    pub async fn status(&self) -> Option<JobState> {
        self.executor.status(self.id).await
    }

    pub async fn result(&self, timeout: Option<Duration>) -> Result<ResultArtifact, OffloadError> {
        self.executor.wait(self.id, timeout).await
    }

    pub async fn cancel(&self) -> Result<(), OffloadError> {
        self.executor.cancel(self.id).await
    }

    pub fn runtime(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    pub async fn is_complete(&self) -> bool {
        self.status().await.is_some_and(JobState::is_terminal)
    }

    pub fn id(&self) -> JobId {
        self.id
    }
}

/// Runs the bootstrap contract directly as a child process, bypassing the
/// executor's poller entirely — there is nothing to poll when the call and
/// the caller share a filesystem.
async fn run_local_in_process(
    function_name: &str,
    function_source: &str,
    payload: &ArgumentPayload,
    local_callee_sources: &std::collections::BTreeMap<String, String>,
) -> Result<ResultArtifact, OffloadError> {
    let dir = tempfile::tempdir().map_err(OffloadError::Io)?;
    let report = offload_analyze::analyze(function_source, function_name)
        .map_err(|e| OffloadError::SubmissionRejected(e.to_string()))?;

    tokio::fs::create_dir_all(dir.path().join("sources"))
        .await
        .map_err(OffloadError::Io)?;
    tokio::fs::write(
        dir.path().join("sources/function.py"),
        offload_analyze::normalize_source(function_source),
    )
    .await
    .map_err(OffloadError::Io)?;

    let mut resolved_local_calls = Vec::new();
    for call in &report.local_calls {
        if let Some(source) = local_callee_sources.get(&call.name) {
            tokio::fs::write(
                dir.path().join(format!("sources/{}.py", call.name)),
                offload_analyze::normalize_source(source),
            )
            .await
            .map_err(OffloadError::Io)?;
            resolved_local_calls.push(call.name.clone());
        }
    }

    tokio::fs::create_dir_all(dir.path().join("fs_shim"))
        .await
        .map_err(OffloadError::Io)?;
    tokio::fs::write(dir.path().join("fs_shim/offload_fs.py"), crate::bundle::FS_SHIM_SOURCE)
        .await
        .map_err(OffloadError::Io)?;

    let manifest = serde_json::json!({
        "function_name": function_name,
        "source_file": "function.py",
        "argument_format": "json-v1",
        "external_packages": Vec::<String>::new(),
        "dependency_report": {
            "resolved_local_calls": resolved_local_calls,
        },
    });
    tokio::fs::write(dir.path().join("manifest.json"), serde_json::to_vec(&manifest)?)
        .await
        .map_err(OffloadError::Io)?;

    let envelope = ArgsEnvelope::encode(payload);
    tokio::fs::write(dir.path().join("args.payload"), envelope.to_json_bytes()?)
        .await
        .map_err(OffloadError::Io)?;

    let bootstrap_path = dir.path().join("bootstrap");
    tokio::fs::write(&bootstrap_path, crate::bootstrap::generate_script(function_name))
        .await
        .map_err(OffloadError::Io)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&bootstrap_path).await.map_err(OffloadError::Io)?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&bootstrap_path, perms).await.map_err(OffloadError::Io)?;
    }

    let output = Command::new("python3")
        .arg(&bootstrap_path)
        .current_dir(dir.path())
        .env("ORIGINAL_CWD", dir.path())
        .env("OFFLOAD_BACKEND_ID", "local")
        .output()
        .await
        .map_err(OffloadError::Io)?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !stdout.contains(END_MARKER) {
        return Ok(ResultArtifact::Failure {
            error_kind: FailureKind::ArtifactMissing,
            message: "local bootstrap exited without writing a trailing marker".into(),
            remote_traceback: None,
            captured_stdout: Some(stdout),
            captured_stderr: Some(stderr),
        });
    }

    if let Some(line) = stdout.lines().find(|l| l.starts_with(RESULT_MARKER)) {
        let parsed: LocalSuccess = serde_json::from_str(&line[RESULT_MARKER.len()..])?;
        return Ok(ResultArtifact::Success { result: parsed.result, metadata: parsed.metadata });
    }
    if let Some(line) = stdout.lines().find(|l| l.starts_with(ERROR_MARKER)) {
        let parsed: LocalError = serde_json::from_str(&line[ERROR_MARKER.len()..])?;
        return Ok(ResultArtifact::Failure {
            error_kind: FailureKind::RemoteException,
            message: parsed.error,
            remote_traceback: Some(parsed.traceback),
            captured_stdout: Some(stdout),
            captured_stderr: Some(stderr),
        });
    }

    Ok(ResultArtifact::Failure {
        error_kind: FailureKind::ArtifactMissing,
        message: "local bootstrap produced no recognizable result marker".into(),
        remote_traceback: None,
        captured_stdout: Some(stdout),
        captured_stderr: Some(stderr),
    })
}

#[derive(serde::Deserialize)]
struct LocalSuccess {
    result: serde_json::Value,
    metadata: crate::job::ResultMetadata,
}

#[derive(serde::Deserialize)]
struct LocalError {
    error: String,
    traceback: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_layers_merge_with_override_precedence() {
        let process = DispatchDefaults {
            poll_interval: Some(Duration::from_secs(5)),
            interpreter_version: Some("3.10".to_string()),
            ..Default::default()
        };
        let decoration = DispatchDefaults {
            interpreter_version: Some("3.11".to_string()),
            ..Default::default()
        };
        let overrides = DispatchDefaults {
            poll_interval: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let merged = process.merge(&decoration).merge(&overrides);
        assert_eq!(merged.poll_interval, Some(Duration::from_secs(1)));
        assert_eq!(merged.interpreter_version, Some("3.11".to_string()));
    }
}
