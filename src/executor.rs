//! Executor Core (C6, spec.md §4.6, §5).
//!
//! Owns the job registry and drives the state machine. A single long-lived
//! poller task maintains a min-heap of `(next_poll_instant, job_id)` and
//! services due entries as instants pass; adapter `submit`/`probe`/`cancel`
//! and harvester retrieval run through a bounded worker semaphore (default
//! 16) so a slow transport never stalls the poller itself.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tracing::{info, warn};

use crate::backends::BackendAdapter;
use crate::bundle::{BundlePackager, PackageRequest};
use crate::credentials::CredentialResolver;
use crate::fs_abstraction::FsAbstraction;
use crate::harvester::harvest;
use crate::job::{
    AdapterTag, ArgumentPayload, Job, JobId, JobSpec, JobState, ResultArtifact,
};
use crate::target::{ClusterTarget, ResourceRequest, TargetKind};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub poll_interval_ceiling: Duration,
    pub worker_concurrency: usize,
    pub unknown_grace: u32,
    pub result_grace: Duration,
    pub cleanup_on_success: bool,
    pub cleanup_on_failure: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ceiling: Duration::from_secs(30),
            worker_concurrency: 16,
            unknown_grace: 5,
            result_grace: Duration::from_secs(90),
            cleanup_on_success: true,
            cleanup_on_failure: false,
        }
    }
}

pub struct SubmitRequest<'a> {
    pub function_name: &'a str,
    pub function_source: &'a str,
    pub payload: ArgumentPayload,
    pub target: ClusterTarget,
    pub resources: ResourceRequest,
    pub interpreter_version: &'a str,
    pub data_search_roots: Vec<PathBuf>,
    pub local_callee_sources: std::collections::BTreeMap<String, String>,
    pub submission_timeout: Duration,
    pub poll_interval: Duration,
}

struct JobRuntime {
    job: Job,
    backoff: Duration,
}

/// Wakes `wait` callers when a job reaches a terminal state (spec.md §5's
/// condition-variable-fed synchronous wait).
type NotifyMap = Arc<RwLock<HashMap<JobId, Arc<Notify>>>>;

pub struct Executor {
    registry: Arc<RwLock<HashMap<JobId, JobRuntime>>>,
    poll_heap: Arc<Mutex<BinaryHeap<Reverse<(std::time::Instant, JobId)>>>>,
    notify_map: NotifyMap,
    adapters: HashMap<AdapterTag, Arc<dyn BackendAdapter>>,
    transport: Transport,
    packager: BundlePackager,
    credentials: CredentialResolver,
    fs: Arc<FsAbstraction>,
    config: ExecutorConfig,
    worker_permits: Arc<Semaphore>,
    next_id: AtomicU64,
    shutdown: Arc<Notify>,
}

impl Executor {
    pub fn new(
        adapters: HashMap<AdapterTag, Arc<dyn BackendAdapter>>,
        transport: Transport,
        packager: BundlePackager,
        credentials: CredentialResolver,
        fs: Arc<FsAbstraction>,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        let executor = Arc::new(Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            poll_heap: Arc::new(Mutex::new(BinaryHeap::new())),
            notify_map: Arc::new(RwLock::new(HashMap::new())),
            adapters,
            transport,
            packager,
            credentials,
            fs,
            worker_permits: Arc::new(Semaphore::new(config.worker_concurrency)),
            config,
            next_id: AtomicU64::new(1),
            shutdown: Arc::new(Notify::new()),
        });
        executor.clone().spawn_poller();
        executor
    }

    fn adapter_tag(kind: TargetKind) -> AdapterTag {
        match kind {
            TargetKind::Kubernetes => AdapterTag::Kubernetes,
            TargetKind::Ssh => AdapterTag::Ssh,
            TargetKind::ProvisionedVm => AdapterTag::ProvisionedVm,
            _ => AdapterTag::Batch,
        }
    }

    pub async fn submit(&self, req: SubmitRequest<'_>) -> Result<JobId, crate::error::OffloadError> {
        req.resources
            .validate_for(req.target.kind)
            .map_err(|e| crate::error::OffloadError::SubmissionRejected(e.to_string()))?;
        if !req.target.is_valid() {
            return Err(crate::error::OffloadError::SubmissionRejected(format!(
                "target of kind {:?} requires a host",
                req.target.kind
            )));
        }

        let bundle = self.packager.package(&PackageRequest {
            function_name: req.function_name,
            function_source: req.function_source,
            payload: req.payload.clone(),
            target: &req.target,
            interpreter_version: req.interpreter_version,
            data_search_roots: req.data_search_roots,
            local_callee_sources: req.local_callee_sources,
        })?;

        let credentials = self.credentials.resolve(&req.target)?;

        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let remote_dir = format!("{}/{}", req.target.remote_work_dir, bundle.id);

        if req.target.kind != TargetKind::Local {
            self.transport
                .exec(
                    &req.target,
                    &credentials,
                    &format!("mkdir -p {remote_dir}"),
                    None,
                    req.submission_timeout,
                )
                .await
                .map_err(crate::backends::BackendError::from)?;
            let remote_archive = format!("{remote_dir}/bundle.tar.zst");
            self.transport
                .upload(&req.target, &credentials, &bundle.archive_path, &remote_archive)
                .await
                .map_err(crate::backends::BackendError::from)?;
            self.transport
                .exec(
                    &req.target,
                    &credentials,
                    &format!("cd {remote_dir} && zstd -d bundle.tar.zst -c | tar -xf - && rm bundle.tar.zst"),
                    None,
                    req.submission_timeout,
                )
                .await
                .map_err(crate::backends::BackendError::from)?;
        }

        let spec = JobSpec {
            target: req.target.clone(),
            resources: req.resources,
            bundle,
            payload: req.payload,
            submission_timeout: req.submission_timeout,
            poll_interval: req.poll_interval.min(self.config.poll_interval_ceiling),
        };

        let adapter_tag = Self::adapter_tag(req.target.kind);
        let adapter = self
            .adapters
            .get(&adapter_tag)
            .cloned()
            .ok_or_else(|| crate::backends::BackendError::SubmissionRejected(
                format!("no adapter registered for {:?}", adapter_tag),
            ))?;

        let _permit = self.worker_permits.acquire().await.expect("semaphore open");
        let backend_handle = adapter.submit(&spec, &remote_dir).await?;
        drop(_permit);

        let now = chrono::Utc::now();
        let job = Job {
            id,
            state: JobState::Pending,
            spec,
            remote_dir,
            submitted_at: now,
            first_observed_active_at: None,
            terminal_at: None,
            backend_handle: Some(backend_handle),
            adapter: adapter_tag,
            unknown_streak: 0,
            config_hash: req.target.identity_digest(),
        };

        let poll_interval = job.spec.poll_interval;
        self.registry
            .write()
            .await
            .insert(id, JobRuntime { job, backoff: poll_interval });
        self.notify_map.write().await.insert(id, Arc::new(Notify::new()));

        self.schedule(id, poll_interval).await;
        info!(job = %id, "job submitted");
        Ok(id)
    }

    async fn schedule(&self, id: JobId, delay: Duration) {
        let mut heap = self.poll_heap.lock().await;
        heap.push(Reverse((std::time::Instant::now() + delay, id)));
    }

    fn spawn_poller(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.poll_heap.lock().await;
                    heap.peek().map(|Reverse((instant, _))| *instant)
                };
                match next {
                    Some(instant) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(instant.into()) => {}
                            _ = self.shutdown.notified() => break,
                        }
                        let due = {
                            let mut heap = self.poll_heap.lock().await;
                            heap.pop().map(|Reverse((_, id))| id)
                        };
                        if let Some(id) = due {
                            let executor = self.clone();
                            tokio::spawn(async move { executor.poll_one(id).await });
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                            _ = self.shutdown.notified() => break,
                        }
                    }
                }
            }
        });
    }

    async fn poll_one(self: Arc<Self>, id: JobId) {
        let permit = self.worker_permits.acquire().await.expect("semaphore open");
        let (spec, handle, adapter, already_terminal) = {
            let registry = self.registry.read().await;
            let Some(runtime) = registry.get(&id) else { return };
            if runtime.job.state.is_terminal() {
                (None, None, None, true)
            } else {
                let adapter = self.adapters.get(&runtime.job.adapter).cloned();
                (
                    Some(runtime.job.spec.clone()),
                    runtime.job.backend_handle.clone(),
                    adapter,
                    false,
                )
            }
        };
        drop(permit);
        if already_terminal {
            return;
        }
        let (Some(spec), Some(handle), Some(adapter)) = (spec, handle, adapter) else {
            return;
        };

        let result = adapter.probe(&spec, &handle, &self.job_remote_dir(id).await).await;
        let now = chrono::Utc::now();

        match result {
            Ok(observed) => {
                let mut registry = self.registry.write().await;
                if let Some(runtime) = registry.get_mut(&id) {
                    let forced = if observed == JobState::Unknown
                        && runtime.job.unknown_streak + 1 > self.config.unknown_grace
                    {
                        JobState::Failed
                    } else {
                        observed
                    };
                    runtime.job.transition(forced, now);
                    runtime.backoff = spec.poll_interval;
                    let terminal = runtime.job.state.is_terminal();
                    let next_delay = runtime.backoff;
                    drop(registry);
                    if terminal {
                        if let Some(notify) = self.notify_map.read().await.get(&id) {
                            notify.notify_waiters();
                        }
                    } else {
                        self.schedule(id, next_delay).await;
                    }
                }
            }
            Err(e) => {
                warn!(job = %id, error = %e, "probe failed, backing off");
                let mut registry = self.registry.write().await;
                if let Some(runtime) = registry.get_mut(&id) {
                    runtime.backoff = (runtime.backoff * 2).min(Duration::from_secs(30));
                    let delay = runtime.backoff;
                    drop(registry);
                    self.schedule(id, delay).await;
                }
            }
        }
    }

    async fn job_remote_dir(&self, id: JobId) -> String {
        self.registry
            .read()
            .await
            .get(&id)
            .map(|r| r.job.remote_dir.clone())
            .unwrap_or_default()
    }

    pub async fn status(&self, id: JobId) -> Option<JobState> {
        self.registry.read().await.get(&id).map(|r| r.job.state)
    }

    /// Blocks until terminal or `timeout` elapses. On terminal state, runs
    /// the harvester, then schedules cleanup without blocking the caller on it.
    pub async fn wait(
        &self,
        id: JobId,
        timeout: Option<Duration>,
    ) -> Result<ResultArtifact, crate::error::OffloadError> {
        let notify = self
            .notify_map
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(crate::error::OffloadError::JobNotFound(id))?;

        loop {
            let state = self
                .registry
                .read()
                .await
                .get(&id)
                .map(|r| r.job.state)
                .ok_or(crate::error::OffloadError::JobNotFound(id))?;
            if state.is_terminal() {
                break;
            }
            let wait_fut = notify.notified();
            match timeout {
                Some(t) => {
                    if tokio::time::timeout(t, wait_fut).await.is_err() {
                        return Err(crate::error::OffloadError::Timeout {
                            job: id,
                            timeout_secs: t.as_secs(),
                        });
                    }
                }
                None => wait_fut.await,
            }
        }

        let (spec, handle, adapter, remote_dir) = {
            let registry = self.registry.read().await;
            let runtime = registry.get(&id).ok_or(crate::error::OffloadError::JobNotFound(id))?;
            let adapter = self
                .adapters
                .get(&runtime.job.adapter)
                .cloned()
                .expect("adapter present for submitted job");
            (
                runtime.job.spec.clone(),
                runtime.job.backend_handle.clone().expect("handle present at terminal state"),
                adapter,
                runtime.job.remote_dir.clone(),
            )
        };

        let creds = self.credentials.resolve(&spec.target)?;
        let artifact = harvest(
            adapter.as_ref(),
            &spec,
            &handle,
            &remote_dir,
            self.config.result_grace,
            &self.transport,
            &creds,
        )
        .await;

        let succeeded = matches!(&artifact, Ok(ResultArtifact::Success { .. }));
        let should_cleanup = if succeeded {
            self.config.cleanup_on_success
        } else {
            self.config.cleanup_on_failure
        };
        if should_cleanup {
            let adapter = adapter.clone();
            let spec = spec.clone();
            let handle = handle.clone();
            let remote_dir = remote_dir.clone();
            tokio::spawn(async move {
                if let Err(e) = adapter.cleanup(&spec, &handle, &remote_dir).await {
                    warn!(error = %e, "cleanup failed, leaving remote resources in place");
                }
            });
        }

        // Result already handed off above; drop the job from both maps so a
        // completed job doesn't linger forever (spec.md §3).
        self.registry.write().await.remove(&id);
        self.notify_map.write().await.remove(&id);

        artifact.map_err(Into::into)
    }

    /// Best-effort: optimistically transitions the in-memory state, then
    /// reconciles from the next `probe` (spec.md §5).
    pub async fn cancel(&self, id: JobId) -> Result<(), crate::error::OffloadError> {
        let (spec, handle, adapter) = {
            let registry = self.registry.read().await;
            let runtime = registry.get(&id).ok_or(crate::error::OffloadError::JobNotFound(id))?;
            let adapter = self.adapters.get(&runtime.job.adapter).cloned();
            (
                runtime.job.spec.clone(),
                runtime.job.backend_handle.clone(),
                adapter,
            )
        };
        let (Some(handle), Some(adapter)) = (handle, adapter) else {
            return Ok(());
        };
        adapter.cancel(&spec, &handle).await?;

        let mut registry = self.registry.write().await;
        if let Some(runtime) = registry.get_mut(&id) {
            runtime.job.transition(JobState::Cancelled, chrono::Utc::now());
        }
        drop(registry);
        if let Some(notify) = self.notify_map.read().await.get(&id) {
            notify.notify_waiters();
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.worker_concurrency, 16);
        assert_eq!(config.poll_interval_ceiling, Duration::from_secs(30));
        assert!(config.cleanup_on_success);
        assert!(!config.cleanup_on_failure);
    }
}
