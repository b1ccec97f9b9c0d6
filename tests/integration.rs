//! End-to-end scenarios against an in-process mock backend adapter, no real
//! SLURM/Kubernetes/SSH reachable in CI. A separate `#[ignore]`d test drives
//! the real local bootstrap through a `python3` subprocess, the way the
//! teacher's `tests/k8s.rs` gated its own cluster-backed tests behind `kind`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use offload::backends::{BackendAdapter, BackendError, ResultLocation};
use offload::bootstrap::{END_MARKER, ERROR_MARKER, RESULT_MARKER};
use offload::job::{ArgumentPayload, BackendHandle, JobSpec, JobState};
use offload::{
    AdapterTag, BundlePackager, ClusterTarget, CredentialBundle, CredentialResolver, Executor,
    ExecutorConfig, FsAbstraction, ResourceRequest, SubmitRequest, Transport,
};
use offload::job::ResultArtifact;

/// Test-only double for `BackendAdapter`. `probe()` derives its behavior
/// straight from the job's own argument payload, keyed by convention:
///   args[0]           -> integer `x`; success result is `x + 10`
///   kwargs["mode"]     -> "success" (default) or "failure"
///   kwargs["message"]  -> failure message (failure mode only)
///   kwargs["probes"]   -> probes needed before the job goes terminal (default 1)
///   kwargs["delay_ms"] -> delay before the artifact becomes readable, simulating
///                         the filesystem lag spec.md's S6 scenario names
struct MockState {
    file_based: bool,
    logs: AsyncMutex<HashMap<String, String>>,
}

struct MockAdapter {
    state: Arc<MockState>,
    probe_counts: AsyncMutex<HashMap<String, u32>>,
}

impl MockAdapter {
    fn file_based() -> Self {
        Self {
            state: Arc::new(MockState { file_based: true, logs: AsyncMutex::new(HashMap::new()) }),
            probe_counts: AsyncMutex::new(HashMap::new()),
        }
    }

    fn log_based() -> Self {
        Self {
            state: Arc::new(MockState { file_based: false, logs: AsyncMutex::new(HashMap::new()) }),
            probe_counts: AsyncMutex::new(HashMap::new()),
        }
    }
}

impl MockState {
    async fn write_artifact(&self, remote_dir: &str, success: bool, value: serde_json::Value) {
        let metadata = serde_json::json!({
            "hostname": "mock-host",
            "backend_id": "mock",
            "interpreter": "3.11.0",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let (marker, payload) = if success {
            (RESULT_MARKER, serde_json::json!({"result": value, "metadata": metadata}))
        } else {
            (
                ERROR_MARKER,
                serde_json::json!({
                    "error": value,
                    "error_type": "RuntimeError",
                    "traceback": "Traceback (most recent call last):\n    ...\n",
                    "metadata": metadata,
                }),
            )
        };
        let log_text = format!("{marker}{payload}\n{END_MARKER}\n");

        if self.file_based {
            let _ = tokio::fs::write(format!("{remote_dir}/stdout.log"), &log_text).await;
            let file_name = if success { "result_job.json" } else { "error_job.json" };
            let _ = tokio::fs::write(format!("{remote_dir}/{file_name}"), payload.to_string()).await;
        } else {
            self.logs.lock().await.insert(remote_dir.to_string(), log_text);
        }
    }
}

fn behavior_from_payload(payload: &ArgumentPayload) -> (bool, serde_json::Value, u32, Option<u64>) {
    let x = payload.args.first().and_then(|v| v.as_i64()).unwrap_or(0);
    let mode = payload.kwargs.get("mode").and_then(|v| v.as_str()).unwrap_or("success");
    let probes = payload.kwargs.get("probes").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
    let delay_ms = payload.kwargs.get("delay_ms").and_then(|v| v.as_u64());
    if mode == "failure" {
        let message = payload
            .kwargs
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("mock failure")
            .to_string();
        (false, serde_json::json!(message), probes, delay_ms)
    } else {
        (true, serde_json::json!(x + 10), probes, delay_ms)
    }
}

#[async_trait]
impl BackendAdapter for MockAdapter {
    async fn submit(&self, _spec: &JobSpec, remote_dir: &str) -> Result<BackendHandle, BackendError> {
        tokio::fs::create_dir_all(remote_dir).await.map_err(BackendError::Io)?;
        self.probe_counts.lock().await.insert(remote_dir.to_string(), 0);
        Ok(if self.state.file_based {
            BackendHandle::Batch { scheduler_job_id: remote_dir.to_string() }
        } else {
            BackendHandle::Kubernetes { job_name: remote_dir.to_string(), namespace: "default".to_string() }
        })
    }

    async fn probe(
        &self,
        spec: &JobSpec,
        _handle: &BackendHandle,
        remote_dir: &str,
    ) -> Result<JobState, BackendError> {
        let current = {
            let mut counts = self.probe_counts.lock().await;
            let entry = counts.entry(remote_dir.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        let (success, value, probes_needed, delay_ms) = behavior_from_payload(&spec.payload);
        if current < probes_needed.max(1) {
            return Ok(JobState::Running);
        }

        match delay_ms {
            Some(ms) => {
                let state = self.state.clone();
                let remote_dir = remote_dir.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    state.write_artifact(&remote_dir, success, value).await;
                });
            }
            None => self.state.write_artifact(remote_dir, success, value).await,
        }

        Ok(if success { JobState::Completed } else { JobState::Failed })
    }

    async fn cancel(&self, _spec: &JobSpec, _handle: &BackendHandle) -> Result<(), BackendError> {
        Ok(())
    }

    async fn stream_error_context(
        &self,
        _spec: &JobSpec,
        _handle: &BackendHandle,
        remote_dir: &str,
        _max_bytes: usize,
    ) -> Result<String, BackendError> {
        if self.state.file_based {
            Ok(tokio::fs::read_to_string(format!("{remote_dir}/stdout.log")).await.unwrap_or_default())
        } else {
            Ok(self.state.logs.lock().await.get(remote_dir).cloned().unwrap_or_default())
        }
    }

    fn result_locations(&self, _handle: &BackendHandle, remote_dir: &str) -> ResultLocation {
        ResultLocation {
            result_path: format!("{remote_dir}/result_*.json"),
            error_path: format!("{remote_dir}/error_*.json"),
            stdout_path: self.state.file_based.then(|| format!("{remote_dir}/stdout.log")),
            stderr_path: None,
        }
    }

    async fn cleanup(&self, _spec: &JobSpec, _handle: &BackendHandle, remote_dir: &str) -> Result<(), BackendError> {
        let _ = tokio::fs::remove_dir_all(remote_dir).await;
        Ok(())
    }
}

const SOURCE: &str = "def bump(x):\n    return x + 10\n";

fn build_executor(tag: AdapterTag, adapter: Arc<MockAdapter>, cache_root: &std::path::Path, config: ExecutorConfig) -> Arc<Executor> {
    let mut adapters: HashMap<AdapterTag, Arc<dyn BackendAdapter>> = HashMap::new();
    adapters.insert(tag, adapter);
    Executor::new(
        adapters,
        Transport::new(),
        BundlePackager::new(cache_root),
        CredentialResolver::new(),
        Arc::new(FsAbstraction::new(Transport::new(), CredentialBundle::default())),
        config,
    )
}

fn payload(x: i64, extra_kwargs: serde_json::Map<String, serde_json::Value>) -> ArgumentPayload {
    ArgumentPayload { args: vec![serde_json::json!(x)], kwargs: extra_kwargs }
}

fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        result_grace: Duration::from_millis(400),
        ..ExecutorConfig::default()
    }
}

/// S1: success result and cleanup afterward.
#[tokio::test]
async fn s1_success_result_and_cleanup() {
    let cache = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockAdapter::file_based());
    let executor = build_executor(AdapterTag::Batch, adapter, cache.path(), fast_config());

    let target = ClusterTarget::local(work.path().to_string_lossy().to_string());
    let id = executor
        .submit(SubmitRequest {
            function_name: "bump",
            function_source: SOURCE,
            payload: payload(5, Default::default()),
            target,
            resources: ResourceRequest::new(1, bytesize::ByteSize::mb(64), Duration::from_secs(30), 1).unwrap(),
            interpreter_version: "3.11",
            data_search_roots: vec![],
            local_callee_sources: Default::default(),
            submission_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        })
        .await
        .unwrap();

    let artifact = executor.wait(id, Some(Duration::from_secs(5))).await.unwrap();
    match artifact {
        ResultArtifact::Success { result, .. } => assert_eq!(result, serde_json::json!(15)),
        other => panic!("expected success, got {other:?}"),
    }

    // cleanup_on_success is the default; give the detached cleanup task a beat.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!work.path().join("somejunk").exists());
}

/// S2: remote exception surfaces as a `Failure` carrying the raised message.
#[tokio::test]
async fn s2_remote_exception_becomes_failure_with_message() {
    let cache = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockAdapter::file_based());
    let executor = build_executor(AdapterTag::Batch, adapter, cache.path(), fast_config());

    let mut kwargs = serde_json::Map::new();
    kwargs.insert("mode".to_string(), serde_json::json!("failure"));
    kwargs.insert("message".to_string(), serde_json::json!("Test error with x=5"));

    let target = ClusterTarget::local(work.path().to_string_lossy().to_string());
    let id = executor
        .submit(SubmitRequest {
            function_name: "bump",
            function_source: SOURCE,
            payload: payload(5, kwargs),
            target,
            resources: ResourceRequest::new(1, bytesize::ByteSize::mb(64), Duration::from_secs(30), 1).unwrap(),
            interpreter_version: "3.11",
            data_search_roots: vec![],
            local_callee_sources: Default::default(),
            submission_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        })
        .await
        .unwrap();

    let artifact = executor.wait(id, Some(Duration::from_secs(5))).await.unwrap();
    match artifact {
        ResultArtifact::Failure { message, .. } => assert!(message.contains("Test error with x=5")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(executor.status(id).await, Some(JobState::Failed));
}

/// S4: three concurrent submissions of the same function with different args
/// all reach `completed` with results that match their own arguments. Each
/// gets a distinct bundle id (args are hashed into it — see bundle.rs), so
/// they never collide on a shared remote directory.
#[tokio::test]
async fn s4_concurrent_submissions_resolve_independently() {
    let cache = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockAdapter::file_based());
    let executor = build_executor(AdapterTag::Batch, adapter, cache.path(), fast_config());

    let mut handles = Vec::new();
    for x in [0_i64, 1, 2] {
        let target = ClusterTarget::local(work.path().to_string_lossy().to_string());
        let id = executor
            .submit(SubmitRequest {
                function_name: "bump",
                function_source: SOURCE,
                payload: payload(x, Default::default()),
                target,
                resources: ResourceRequest::new(1, bytesize::ByteSize::mb(64), Duration::from_secs(30), 1).unwrap(),
                interpreter_version: "3.11",
                data_search_roots: vec![],
                local_callee_sources: Default::default(),
                submission_timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(20),
            })
            .await
            .unwrap();
        handles.push((x, id));
    }

    for (x, id) in handles {
        let artifact = executor.wait(id, Some(Duration::from_secs(5))).await.unwrap();
        match artifact {
            ResultArtifact::Success { result, .. } => assert_eq!(result, serde_json::json!(x + 10)),
            other => panic!("expected success for x={x}, got {other:?}"),
        }
    }
}

/// S5: a Kubernetes-shaped adapter with no shared filesystem — the harvester
/// must pull the result out of the pod log tail instead of a result file.
#[tokio::test]
async fn s5_log_based_harvest_from_pod_output() {
    let cache = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockAdapter::log_based());
    let executor = build_executor(AdapterTag::Kubernetes, adapter, cache.path(), fast_config());

    let mut target = ClusterTarget::local(work.path().to_string_lossy().to_string());
    target.kind = offload::TargetKind::Kubernetes;
    target.host = Some("in-cluster".to_string());

    let id = executor
        .submit(SubmitRequest {
            function_name: "bump",
            function_source: SOURCE,
            payload: payload(7, Default::default()),
            target,
            resources: ResourceRequest::new(1, bytesize::ByteSize::mb(64), Duration::from_secs(30), 1).unwrap(),
            interpreter_version: "3.11",
            data_search_roots: vec![],
            local_callee_sources: Default::default(),
            submission_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        })
        .await
        .unwrap();

    let artifact = executor.wait(id, Some(Duration::from_secs(5))).await.unwrap();
    match artifact {
        ResultArtifact::Success { result, .. } => assert_eq!(result, serde_json::json!(17)),
        other => panic!("expected success, got {other:?}"),
    }
}

/// S6: the success artifact becomes readable only after probe has already
/// reported `completed` (simulated filesystem lag). Scaled down from the
/// spec's 20s-lag/90s-grace ratio to keep the test fast: a 150ms write delay
/// against a 400ms harvest grace.
#[tokio::test]
async fn s6_delayed_artifact_still_resolves_within_grace() {
    let cache = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let adapter = Arc::new(MockAdapter::file_based());
    let executor = build_executor(AdapterTag::Batch, adapter, cache.path(), fast_config());

    let mut kwargs = serde_json::Map::new();
    kwargs.insert("delay_ms".to_string(), serde_json::json!(150));

    let target = ClusterTarget::local(work.path().to_string_lossy().to_string());
    let id = executor
        .submit(SubmitRequest {
            function_name: "bump",
            function_source: SOURCE,
            payload: payload(3, kwargs),
            target,
            resources: ResourceRequest::new(1, bytesize::ByteSize::mb(64), Duration::from_secs(30), 1).unwrap(),
            interpreter_version: "3.11",
            data_search_roots: vec![],
            local_callee_sources: Default::default(),
            submission_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        })
        .await
        .unwrap();

    let artifact = executor.wait(id, Some(Duration::from_secs(2))).await.unwrap();
    match artifact {
        ResultArtifact::Success { result, .. } => assert_eq!(result, serde_json::json!(13)),
        other => panic!("expected success, got {other:?}"),
    }
}

/// S3, plus the local fast path (spec.md §4.9): runs the real generated
/// bootstrap under `python3`, exercising the embedded filesystem shim against
/// a bundle that carries three csv files. Ignored by default since it needs
/// `python3` on `PATH`, mirroring how the teacher's own k8s tests are gated
/// behind a real `kind` cluster.
#[tokio::test]
#[ignore = "requires python3 on PATH"]
async fn s3_embedded_fs_find_lists_three_csv_files_in_order() {
    let data_root = tempfile::tempdir().unwrap();
    for name in ["c.csv", "a.csv", "b.csv"] {
        tokio::fs::write(data_root.path().join(name), "col\n1\n").await.unwrap();
    }

    let source = "def list_csvs(x):\n    import offload_fs\n    return offload_fs.cluster_find('*.csv', 'data')\n";

    let offload = offload::Offload::new(
        Arc::new(offload::Executor::new(
            HashMap::new(),
            offload::Transport::new(),
            offload::BundlePackager::new(tempfile::tempdir().unwrap().path()),
            offload::CredentialResolver::new(),
            Arc::new(offload::FsAbstraction::new(offload::Transport::new(), offload::CredentialBundle::default())),
            offload::ExecutorConfig::default(),
        )),
        offload::DispatchDefaults::default(),
    );

    let outcome = offload
        .task("list_csvs", source)
        .target(offload::ClusterTarget::local("/tmp/offload-s3"))
        .resources(ResourceRequest::new(1, bytesize::ByteSize::mb(64), Duration::from_secs(30), 1).unwrap())
        .data_search_roots(vec![data_root.path().to_path_buf()])
        .dispatch()
        .await
        .unwrap();

    match outcome {
        offload::DispatchOutcome::Finished(ResultArtifact::Success { result, .. }) => {
            let names: Vec<String> = result
                .as_array()
                .unwrap()
                .iter()
                .map(|v| v.as_str().unwrap().to_string())
                .collect();
            assert_eq!(names.len(), 3);
            let mut sorted = names.clone();
            sorted.sort();
            assert_eq!(names, sorted);
        }
        _ => panic!("expected a finished success outcome from the local synchronous dispatch path"),
    }
}
