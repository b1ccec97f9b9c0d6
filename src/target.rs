//! Execution destinations and resource requests (spec.md §3).

use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The concrete execution substrate a [`ClusterTarget`] addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    Slurm,
    Pbs,
    Sge,
    Lsf,
    Kubernetes,
    Ssh,
    Local,
    ProvisionedVm,
}

impl TargetKind {
    /// Only Kubernetes permits fractional core requests (spec.md §3, §8).
    pub fn allows_fractional_cores(self) -> bool {
        matches!(self, TargetKind::Kubernetes)
    }

    pub fn is_batch_scheduler(self) -> bool {
        matches!(
            self,
            TargetKind::Slurm | TargetKind::Pbs | TargetKind::Sge | TargetKind::Lsf
        )
    }
}

/// Addressable execution destination. Immutable within one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterTarget {
    pub kind: TargetKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub remote_work_dir: String,
    pub default_partition: Option<String>,
    pub default_container_image: Option<String>,
    #[serde(default)]
    pub module_loads: Vec<String>,
    #[serde(default)]
    pub environment_overrides: std::collections::BTreeMap<String, String>,
    /// User-facing label for logs and error messages only; excluded from the
    /// bundle-id digest since it carries no execution semantics.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

impl ClusterTarget {
    pub fn local(remote_work_dir: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Local,
            host: None,
            port: None,
            username: None,
            remote_work_dir: remote_work_dir.into(),
            default_partition: None,
            default_container_image: None,
            module_loads: Vec::new(),
            environment_overrides: Default::default(),
            name: None,
            connect_timeout: default_connect_timeout(),
        }
    }

    /// Invariant from spec.md §3: a non-local target must carry a host.
    pub fn is_valid(&self) -> bool {
        match self.kind {
            TargetKind::Local => true,
            _ => self.host.is_some(),
        }
    }

    /// Digest of the fields that affect bundle reproducibility. Deliberately
    /// excludes `name`, which is presentation-only.
    pub fn identity_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{:?}", self.kind));
        hasher.update(self.host.as_deref().unwrap_or(""));
        hasher.update(self.port.map(|p| p.to_string()).unwrap_or_default());
        hasher.update(self.username.as_deref().unwrap_or(""));
        hasher.update(&self.remote_work_dir);
        hasher.update(self.default_partition.as_deref().unwrap_or(""));
        hasher.update(self.default_container_image.as_deref().unwrap_or(""));
        for m in &self.module_loads {
            hasher.update(m);
        }
        for (k, v) in &self.environment_overrides {
            hasher.update(k);
            hasher.update(v);
        }
        format!("{:x}", hasher.finalize())[..16].to_string()
    }
}

/// Resource request for a single job (spec.md §3).
///
/// `cores` is stored as a rational (`numerator`/`denominator`) so Kubernetes's
/// fractional CPU requests round-trip exactly; every other backend requires
/// `denominator == 1` and rejects anything else at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    cores_numerator: u32,
    cores_denominator: u32,
    #[serde(with = "bytesize_serde")]
    pub memory: ByteSize,
    pub wall_time: Duration,
    pub partition: Option<String>,
    pub nodes: u32,
    pub gpus: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResourceRequestError {
    #[error("cores must be >= 1 for backend {0:?} (fractional cores are Kubernetes-only)")]
    FractionalCoresUnsupported(TargetKind),
    #[error("nodes must be >= 1")]
    ZeroNodes,
    #[error("invalid memory string `{0}`")]
    InvalidMemory(String),
}

impl ResourceRequest {
    pub fn new(
        cores: u32,
        memory: ByteSize,
        wall_time: Duration,
        nodes: u32,
    ) -> Result<Self, ResourceRequestError> {
        if nodes == 0 {
            return Err(ResourceRequestError::ZeroNodes);
        }
        Ok(Self {
            cores_numerator: cores,
            cores_denominator: 1,
            memory,
            wall_time,
            partition: None,
            nodes,
            gpus: 0,
        })
    }

    /// Fractional cores, e.g. `500m` Kubernetes CPU requests expressed as `1/2`.
    pub fn fractional_cores(numerator: u32, denominator: u32) -> Self {
        Self {
            cores_numerator: numerator,
            cores_denominator: denominator.max(1),
            memory: ByteSize::gb(1),
            wall_time: Duration::from_secs(3600),
            partition: None,
            nodes: 1,
            gpus: 0,
        }
    }

    pub fn cores(&self) -> f64 {
        self.cores_numerator as f64 / self.cores_denominator as f64
    }

    pub fn is_fractional(&self) -> bool {
        self.cores_denominator != 1
    }

    /// Validate against a backend's fractional-core support (spec.md §8).
    pub fn validate_for(&self, kind: TargetKind) -> Result<(), ResourceRequestError> {
        if self.is_fractional() && !kind.allows_fractional_cores() {
            return Err(ResourceRequestError::FractionalCoresUnsupported(kind));
        }
        if !self.is_fractional() && self.cores_numerator == 0 && !kind.allows_fractional_cores() {
            return Err(ResourceRequestError::FractionalCoresUnsupported(kind));
        }
        Ok(())
    }

    /// Parse a human memory string (`1GB`, `1.5GiB`, `1Gi`, ...) to an exact
    /// byte count (spec.md §8 boundary cases). Every unit is read as a
    /// binary (1024-based) multiple regardless of whether it carries the
    /// `i` infix: `1GB`, `1024MB`, and `1Gi` all mean `2^30` bytes. This is
    /// the only reading under which those three literals — and `1.5GB`/
    /// `1536MB` — land on identical byte counts, which is what the spec's
    /// exactness law requires; a decimal (1000-based) `GB`/`MB` would make
    /// `1GB` and `1024MB` two different numbers.
    pub fn parse_memory(s: &str) -> Result<ByteSize, ResourceRequestError> {
        let err = || ResourceRequestError::InvalidMemory(s.to_string());
        let trimmed = s.trim();
        let split_at = trimmed.find(|c: char| c.is_alphabetic()).ok_or_else(err)?;
        let (number, unit) = trimmed.split_at(split_at);
        let value: f64 = number.parse().map_err(|_| err())?;

        let unit_upper = unit.trim().to_ascii_uppercase();
        let base_unit = unit_upper.trim_end_matches('B').trim_end_matches('I');
        let multiplier = match base_unit {
            "" => 1.0,
            "K" => 1024.0,
            "M" => 1024.0f64.powi(2),
            "G" => 1024.0f64.powi(3),
            "T" => 1024.0f64.powi(4),
            _ => return Err(err()),
        };

        let bytes = value * multiplier;
        if !bytes.is_finite() || bytes < 0.0 {
            return Err(err());
        }
        Ok(ByteSize::b(bytes.round() as u64))
    }
}

mod bytesize_serde {
    use bytesize::ByteSize;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &ByteSize, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_u64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ByteSize, D::Error> {
        let bytes = u64::deserialize(d)?;
        Ok(ByteSize::b(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_boundary_cases_normalize_to_identical_byte_counts() {
        let one_gb = ResourceRequest::parse_memory("1GB").unwrap();
        assert_eq!(one_gb, ResourceRequest::parse_memory("1024MB").unwrap());
        assert_eq!(one_gb, ResourceRequest::parse_memory("1Gi").unwrap());
        assert_eq!(one_gb, ByteSize::gib(1));

        let one_and_a_half_gb = ResourceRequest::parse_memory("1.5GB").unwrap();
        assert_eq!(
            one_and_a_half_gb,
            ResourceRequest::parse_memory("1536MB").unwrap()
        );
        assert_eq!(one_and_a_half_gb, ByteSize::b(1_610_612_736));
    }

    #[test]
    fn fractional_kilobyte_memory_rounds_to_nearest_byte() {
        assert_eq!(ResourceRequest::parse_memory("0.5K").unwrap(), ByteSize::b(512));
    }

    #[test]
    fn zero_cores_rejected_for_slurm_but_allowed_fractional_on_kubernetes() {
        let zero = ResourceRequest::fractional_cores(0, 1);
        assert!(zero.validate_for(TargetKind::Slurm).is_err());

        let half = ResourceRequest::fractional_cores(1, 2);
        assert!(half.validate_for(TargetKind::Kubernetes).is_ok());
        assert!(half.validate_for(TargetKind::Slurm).is_err());
    }

    #[test]
    fn identity_digest_ignores_display_name() {
        let mut a = ClusterTarget::local("/work");
        let mut b = a.clone();
        a.name = Some("alice's laptop".to_string());
        b.name = Some("bob's workstation".to_string());
        assert_eq!(a.identity_digest(), b.identity_digest());
    }

    #[test]
    fn local_target_is_valid_without_host() {
        assert!(ClusterTarget::local("/work").is_valid());
    }

    #[test]
    fn non_local_target_without_host_is_invalid() {
        let mut t = ClusterTarget::local("/work");
        t.kind = TargetKind::Ssh;
        assert!(!t.is_valid());
    }
}
