//! Dispatches annotated Python callables to a remote execution substrate —
//! SLURM/PBS/SGE/LSF batch schedulers, Kubernetes, a bare SSH host, or a
//! freshly provisioned cloud VM — and blocks (or hands back a movable
//! handle) until a [`job::ResultArtifact`] comes back.
//!
//! [`dispatch::Offload`] is the surface most callers touch. Everything else
//! is the machinery behind it: static analysis of the captured function
//! ([`offload_analyze`], a separate crate), bundle packaging
//! ([`bundle`]), credential resolution ([`credentials`]), wire transport
//! ([`transport`]), the four backend adapters ([`backends`]), the executor
//! that owns the job registry and poll loop ([`executor`]), and the result
//! harvester that reconciles a terminal job with its artifact
//! ([`harvester`]).

pub mod backends;
pub mod bootstrap;
pub mod bundle;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod fs_abstraction;
pub mod harvester;
pub mod job;
pub mod target;
pub mod transport;

pub use backends::{BackendAdapter, BackendError, ResultLocation};
pub use backends::batch::BatchAdapter;
pub use backends::kubernetes::KubernetesAdapter;
pub use backends::provisioned::{ProvisionedAdapter, ProvisionedEndpoint};
pub use backends::ssh_backend::SshAdapter;
pub use bundle::{BundlePackager, BundleRef, PackageRequest, PackagingError};
pub use credentials::{CredentialBundle, CredentialError, CredentialResolver};
pub use dispatch::{DependencyInstaller, DispatchDefaults, DispatchOutcome, JobHandle, Offload, TaskBuilder};
pub use error::OffloadError;
pub use executor::{Executor, ExecutorConfig, SubmitRequest};
pub use fs_abstraction::{FsAbstraction, FsError};
pub use harvester::HarvestError;
pub use job::{
    AdapterTag, ArgumentPayload, BackendHandle, FailureKind, Job, JobId, JobSpec, JobState,
    ResultArtifact, ResultMetadata,
};
pub use target::{ClusterTarget, ResourceRequest, ResourceRequestError, TargetKind};
pub use transport::{ExecResult, Transport, TransportError};
