//! Kubernetes backend adapter (spec.md §4.7).
//!
//! Runs the bundle as a one-shot `batch/v1` `Job`, mirroring the teacher's
//! `k8s.rs::run_job` pattern: build the manifest, create it, and let the
//! executor's poll loop (not a blocking `await_condition`) observe progress.
//! Fractional CPU requests map straight onto Kubernetes's millicore `Quantity`
//! format, the one substrate spec.md allows them on.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job as K8sJob, JobSpec as K8sJobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, LogParams, PostParams};
use kube::{Client, Config};
use tracing::{info, warn};

use crate::job::{BackendHandle, JobSpec, JobState};

use super::{BackendAdapter, BackendError, ResultLocation};

pub struct KubernetesAdapter {
    namespace: String,
}

impl KubernetesAdapter {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into() }
    }

    async fn client() -> Result<Client, BackendError> {
        let config = Config::infer()
            .await
            .map_err(|e| BackendError::Kubernetes(e.to_string()))?;
        Client::try_from(config).map_err(|e| BackendError::Kubernetes(e.to_string()))
    }

    fn job_name(spec: &JobSpec) -> String {
        let suffix: String = (0..6).map(|_| fastrand::alphanumeric()).collect();
        format!("offload-{}-{}", &spec.bundle.id[..8], suffix.to_lowercase())
    }

    fn build_manifest(spec: &JobSpec, job_name: &str) -> Result<K8sJob, BackendError> {
        let image = spec
            .target
            .default_container_image
            .clone()
            .ok_or_else(|| BackendError::SubmissionRejected("kubernetes target requires a container image".into()))?;

        let cores = spec.resources.cores();
        let millicores = (cores * 1000.0).round() as i64;
        let mem_bytes = spec.resources.memory.as_u64();

        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity(format!("{millicores}m")));
        requests.insert("memory".to_string(), Quantity(format!("{mem_bytes}")));
        let mut limits = requests.clone();
        if spec.resources.gpus > 0 {
            limits.insert(
                "nvidia.com/gpu".to_string(),
                Quantity(spec.resources.gpus.to_string()),
            );
        }

        let env: Vec<EnvVar> = spec
            .target
            .environment_overrides
            .iter()
            .map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()), ..Default::default() })
            .chain(std::iter::once(EnvVar {
                name: "ORIGINAL_CWD".to_string(),
                value: Some("/work".to_string()),
                ..Default::default()
            }))
            .collect();

        let container = Container {
            name: "offload-task".to_string(),
            image: Some(image),
            command: Some(vec!["sh".to_string(), "-c".to_string()]),
            args: Some(vec!["cd /work && chmod +x bootstrap && ./bootstrap".to_string()]),
            env: Some(env),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                limits: Some(limits),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut labels = BTreeMap::new();
        labels.insert("offload.job".to_string(), job_name.to_string());
        labels.insert("offload.bundle".to_string(), spec.bundle.id.clone());

        Ok(K8sJob {
            metadata: ObjectMeta {
                name: Some(job_name.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(K8sJobSpec {
                backoff_limit: Some(0),
                ttl_seconds_after_finished: Some(3600),
                active_deadline_seconds: Some(spec.resources.wall_time.as_secs() as i64),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![container],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

#[async_trait]
impl BackendAdapter for KubernetesAdapter {
    async fn submit(&self, spec: &JobSpec, _remote_dir: &str) -> Result<BackendHandle, BackendError> {
        let client = Self::client().await?;
        let job_name = Self::job_name(spec);
        let manifest = Self::build_manifest(spec, &job_name)?;

        info!(job = %job_name, namespace = %self.namespace, "creating kubernetes job");
        let jobs: Api<K8sJob> = Api::namespaced(client, &self.namespace);
        jobs.create(&PostParams::default(), &manifest)
            .await
            .map_err(|e| BackendError::SubmissionRejected(e.to_string()))?;

        Ok(BackendHandle::Kubernetes { job_name, namespace: self.namespace.clone() })
    }

    async fn probe(
        &self,
        _spec: &JobSpec,
        handle: &BackendHandle,
        _remote_dir: &str,
    ) -> Result<JobState, BackendError> {
        let BackendHandle::Kubernetes { job_name, namespace } = handle else {
            return Err(BackendError::ProbeFailed("wrong handle type for kubernetes adapter".into()));
        };
        let client = Self::client().await?;
        let jobs: Api<K8sJob> = Api::namespaced(client, namespace);
        let job = match jobs.get(job_name).await {
            Ok(j) => j,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(JobState::Unknown),
            Err(e) => return Err(BackendError::Kubernetes(e.to_string())),
        };
        let Some(status) = job.status else { return Ok(JobState::Unknown) };
        if status.succeeded.unwrap_or(0) > 0 {
            return Ok(JobState::Completed);
        }
        if status.failed.unwrap_or(0) > 0 {
            return Ok(JobState::Failed);
        }
        if status.active.unwrap_or(0) > 0 {
            return Ok(JobState::Running);
        }
        Ok(JobState::Pending)
    }

    async fn cancel(&self, _spec: &JobSpec, handle: &BackendHandle) -> Result<(), BackendError> {
        let BackendHandle::Kubernetes { job_name, namespace } = handle else {
            return Err(BackendError::CancelFailed("wrong handle type".into()));
        };
        let client = Self::client().await?;
        let jobs: Api<K8sJob> = Api::namespaced(client, namespace);
        let _ = jobs.delete(job_name, &DeleteParams::default()).await;
        Ok(())
    }

    async fn stream_error_context(
        &self,
        _spec: &JobSpec,
        handle: &BackendHandle,
        _remote_dir: &str,
        max_bytes: usize,
    ) -> Result<String, BackendError> {
        let BackendHandle::Kubernetes { job_name, namespace } = handle else {
            return Ok(String::new());
        };
        let client = Self::client().await?;
        let pods: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(client.clone(), namespace);
        let list = pods
            .list(&kube::api::ListParams::default().labels(&format!("job-name={job_name}")))
            .await
            .map_err(|e| BackendError::Kubernetes(e.to_string()))?;
        let Some(pod) = list.items.first().and_then(|p| p.metadata.name.clone()) else {
            return Ok(String::new());
        };
        let logs = pods
            .logs(&pod, &LogParams { tail_lines: Some(200), ..Default::default() })
            .await
            .unwrap_or_default();
        Ok(logs.chars().rev().take(max_bytes).collect::<String>().chars().rev().collect())
    }

    fn result_locations(&self, handle: &BackendHandle, _remote_dir: &str) -> ResultLocation {
        let job_name = match handle {
            BackendHandle::Kubernetes { job_name, .. } => job_name.clone(),
            _ => "unknown".to_string(),
        };
        ResultLocation {
            result_path: format!("/work/result_*_{job_name}.json"),
            error_path: format!("/work/error_*_{job_name}.json"),
            stdout_path: None,
            stderr_path: None,
        }
    }

    async fn cleanup(
        &self,
        _spec: &JobSpec,
        handle: &BackendHandle,
        _remote_dir: &str,
    ) -> Result<(), BackendError> {
        let BackendHandle::Kubernetes { job_name, namespace } = handle else {
            return Ok(());
        };
        let client = Self::client().await?;
        let jobs: Api<K8sJob> = Api::namespaced(client, namespace);
        if let Err(e) = jobs.delete(job_name, &DeleteParams::default()).await {
            warn!(job = %job_name, error = %e, "kubernetes job delete failed, relying on TTL");
        }
        Ok(())
    }
}

pub(crate) const _PROBE_INTERVAL_FLOOR: Duration = Duration::from_secs(2);
