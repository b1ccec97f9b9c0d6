//! Provisioned cloud-VM adapter (spec.md §4.7, §6).
//!
//! The core never creates cloud resources itself — it consumes a
//! [`ProvisionedTarget`] collaborator that hands back a reachable endpoint
//! and tears it down again. Provisioning happens exactly once, at submit;
//! the endpoint is cached on `BackendHandle::ProvisionedVm` so every later
//! probe/cancel/cleanup reuses it rather than provisioning a fresh VM per
//! tick. Once provisioned, dispatch behaves like the plain SSH adapter.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::credentials::CredentialBundle;
use crate::job::{BackendHandle, JobSpec, JobState};
use crate::transport::Transport;

use super::ssh_backend::SshAdapter;
use super::{BackendAdapter, BackendError, ResultLocation};

/// What a provisioning collaborator must hand back (spec.md §6).
pub struct ProvisionedEndpoint {
    pub host: String,
    pub username: String,
    pub credential: CredentialBundle,
    pub teardown_token: String,
}

/// External collaborator the core does not implement (spec.md §6, Non-goal:
/// "Cloud-provider resource provisioning"). Callers supply a concrete impl
/// (e.g. wrapping a cloud SDK or Terraform invocation).
#[async_trait]
pub trait ProvisionedTarget: Send + Sync {
    async fn provision(&self) -> Result<ProvisionedEndpoint, BackendError>;
    async fn teardown(&self, teardown_token: &str) -> Result<(), BackendError>;
}

pub struct ProvisionedAdapter {
    provisioner: Box<dyn ProvisionedTarget>,
    transport: Transport,
}

impl ProvisionedAdapter {
    pub fn new(provisioner: Box<dyn ProvisionedTarget>, transport: Transport) -> Self {
        Self { provisioner, transport }
    }

    fn spec_for(spec: &JobSpec, host: &str, username: &str) -> JobSpec {
        let mut target = spec.target.clone();
        target.host = Some(host.to_string());
        target.username = Some(username.to_string());
        let mut provisioned_spec = spec.clone();
        provisioned_spec.target = target;
        provisioned_spec
    }

    /// The transport pool keys sessions by `(host, port, user)`; once submit
    /// has connected once, later calls on the same handle reuse that pooled
    /// session, so a placeholder credential bundle is enough here.
    fn ssh_adapter(&self) -> SshAdapter {
        SshAdapter::new(self.transport.clone(), CredentialBundle::default())
    }
}

#[async_trait]
impl BackendAdapter for ProvisionedAdapter {
    async fn submit(&self, spec: &JobSpec, remote_dir: &str) -> Result<BackendHandle, BackendError> {
        info!("requesting provisioned endpoint");
        let endpoint = self.provisioner.provision().await?;
        let provisioned_spec = Self::spec_for(spec, &endpoint.host, &endpoint.username);

        let adapter = SshAdapter::new(self.transport.clone(), endpoint.credential);
        let handle = adapter.submit(&provisioned_spec, remote_dir).await?;
        let pid = match handle {
            BackendHandle::Ssh { pid } => pid,
            _ => None,
        };
        Ok(BackendHandle::ProvisionedVm {
            host: endpoint.host,
            username: endpoint.username,
            teardown_token: endpoint.teardown_token,
            pid,
        })
    }

    async fn probe(
        &self,
        spec: &JobSpec,
        handle: &BackendHandle,
        remote_dir: &str,
    ) -> Result<JobState, BackendError> {
        let BackendHandle::ProvisionedVm { host, username, pid, .. } = handle else {
            return Err(BackendError::ProbeFailed("wrong handle type for provisioned adapter".into()));
        };
        let provisioned_spec = Self::spec_for(spec, host, username);
        self.ssh_adapter()
            .probe(&provisioned_spec, &BackendHandle::Ssh { pid: *pid }, remote_dir)
            .await
    }

    async fn cancel(&self, spec: &JobSpec, handle: &BackendHandle) -> Result<(), BackendError> {
        let BackendHandle::ProvisionedVm { host, username, pid, .. } = handle else {
            return Err(BackendError::CancelFailed("wrong handle type".into()));
        };
        let provisioned_spec = Self::spec_for(spec, host, username);
        self.ssh_adapter()
            .cancel(&provisioned_spec, &BackendHandle::Ssh { pid: *pid })
            .await
    }

    async fn stream_error_context(
        &self,
        spec: &JobSpec,
        handle: &BackendHandle,
        remote_dir: &str,
        max_bytes: usize,
    ) -> Result<String, BackendError> {
        let BackendHandle::ProvisionedVm { host, username, pid, .. } = handle else {
            return Ok(String::new());
        };
        let provisioned_spec = Self::spec_for(spec, host, username);
        self.ssh_adapter()
            .stream_error_context(&provisioned_spec, &BackendHandle::Ssh { pid: *pid }, remote_dir, max_bytes)
            .await
    }

    fn result_locations(&self, handle: &BackendHandle, remote_dir: &str) -> ResultLocation {
        let pid = match handle {
            BackendHandle::ProvisionedVm { pid, .. } => *pid,
            _ => None,
        };
        self.ssh_adapter()
            .result_locations(&BackendHandle::Ssh { pid }, remote_dir)
    }

    /// Tears down the provisioned endpoint after the harvester has the
    /// artifact; this is the one terminal action spec.md §4.7 adds beyond
    /// plain SSH behavior.
    async fn cleanup(
        &self,
        spec: &JobSpec,
        handle: &BackendHandle,
        remote_dir: &str,
    ) -> Result<(), BackendError> {
        let BackendHandle::ProvisionedVm { host, username, teardown_token, pid } = handle else {
            return Ok(());
        };
        let provisioned_spec = Self::spec_for(spec, host, username);
        let _ = self
            .ssh_adapter()
            .cleanup(&provisioned_spec, &BackendHandle::Ssh { pid: *pid }, remote_dir)
            .await;

        if let Err(e) = self.provisioner.teardown(teardown_token).await {
            warn!(error = %e, "provisioned endpoint teardown failed");
            return Err(e);
        }
        Ok(())
    }
}
