//! Credential Resolver (C1, spec.md §4.1).
//!
//! Consults sources in strict order and returns the first non-empty match.
//! Never logs a secret value; logs only the source identity and a
//! length-only indicator, mirroring the teacher's own rule against leaking
//! task command lines that might carry user secrets into structured fields.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::target::ClusterTarget;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential source produced a value for target `{0}` (non-local target requires auth)")]
    CredentialMissing(String),
    #[error("credential source `{source}` returned a value that failed authentication")]
    CredentialInvalid { source: String },
    #[error("credential file {path} is not owner-only (mode {mode:o}); refusing to read it")]
    PermissionsTooOpen { path: PathBuf, mode: u32 },
    #[error("credential file io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Resolved secret material for one target. Zeroed by the caller after
/// transport completes; never serialized, never written to disk.
#[derive(Default)]
pub struct CredentialBundle {
    pub password: Option<String>,
    pub private_key_bytes: Option<Vec<u8>>,
    pub private_key_passphrase: Option<String>,
    pub bearer_token: Option<String>,
}

impl CredentialBundle {
    fn is_empty(&self) -> bool {
        self.password.is_none()
            && self.private_key_bytes.is_none()
            && self.bearer_token.is_none()
    }
}

impl Drop for CredentialBundle {
    fn drop(&mut self) {
        if let Some(p) = self.password.as_mut() {
            zero_string(p);
        }
        if let Some(p) = self.private_key_passphrase.as_mut() {
            zero_string(p);
        }
        if let Some(k) = self.private_key_bytes.as_mut() {
            k.iter_mut().for_each(|b| *b = 0);
        }
        if let Some(t) = self.bearer_token.as_mut() {
            zero_string(t);
        }
    }
}

fn zero_string(s: &mut String) {
    // SAFETY: overwriting in place with ASCII zero bytes keeps the string valid UTF-8.
    unsafe {
        for b in s.as_bytes_mut() {
            *b = 0;
        }
    }
}

/// Process-scoped configuration supplied by the caller (source 1).
#[derive(Default, Clone)]
pub struct ProcessCredentials(pub HashMap<String, String>);

#[derive(Deserialize)]
struct CredentialFile(HashMap<String, CredentialFileEntry>);

#[derive(Deserialize)]
struct CredentialFileEntry {
    #[allow(dead_code)]
    cluster_type: Option<String>,
    #[allow(dead_code)]
    cluster_host: Option<String>,
    #[allow(dead_code)]
    username: Option<String>,
    auth_method: String,
    password: Option<String>,
    key_path: Option<String>,
    token: Option<String>,
}

pub struct CredentialResolver {
    process: ProcessCredentials,
    credential_file: Option<PathBuf>,
    secret_store_cmd: Option<String>,
    interactive: bool,
}

impl CredentialResolver {
    pub fn new() -> Self {
        Self {
            process: ProcessCredentials::default(),
            credential_file: dirs::home_dir().map(|h| h.join(".offload").join("credentials.json")),
            secret_store_cmd: std::env::var("OFFLOAD_SECRET_STORE_CMD").ok(),
            interactive: false,
        }
    }

    pub fn with_process_credentials(mut self, creds: ProcessCredentials) -> Self {
        self.process = creds;
        self
    }

    pub fn with_credential_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.credential_file = Some(path.into());
        self
    }

    /// Declares interactive use; without this, the terminal prompt source is
    /// always skipped even when stdin is a tty.
    pub fn interactive(mut self, yes: bool) -> Self {
        self.interactive = yes;
        self
    }

    pub fn resolve(&self, target: &ClusterTarget) -> Result<CredentialBundle, CredentialError> {
        let key = target_key(target);

        if target.kind == crate::target::TargetKind::Local {
            return Ok(CredentialBundle::default());
        }

        if let Some(bundle) = self.from_process_config(&key) {
            info!(source = "process", target = %key, "resolved credential");
            return Ok(bundle);
        }

        if let Some(bundle) = self.from_env(&key) {
            info!(source = "env", target = %key, "resolved credential");
            return Ok(bundle);
        }

        if let Some(bundle) = self.from_secret_store(&key)? {
            info!(source = "secret-store", target = %key, "resolved credential");
            return Ok(bundle);
        }

        if let Some(bundle) = self.from_credential_file(&key)? {
            info!(source = "credential-file", target = %key, "resolved credential");
            return Ok(bundle);
        }

        if let Some(bundle) = self.from_interactive_prompt(&key) {
            info!(source = "interactive", target = %key, "resolved credential");
            return Ok(bundle);
        }

        Err(CredentialError::CredentialMissing(key))
    }

    fn from_process_config(&self, key: &str) -> Option<CredentialBundle> {
        let password = self.process.0.get(&format!("{key}_PASSWORD")).cloned();
        let token = self.process.0.get(&format!("{key}_TOKEN")).cloned();
        let bundle = CredentialBundle {
            password,
            bearer_token: token,
            ..Default::default()
        };
        (!bundle.is_empty()).then_some(bundle)
    }

    fn from_env(&self, key: &str) -> Option<CredentialBundle> {
        let password = std::env::var(format!("{key}_PASSWORD"))
            .ok()
            .or_else(|| std::env::var("OFFLOAD_PASSWORD").ok());
        let token = std::env::var(format!("{key}_TOKEN")).ok();
        let key_path = std::env::var(format!("{key}_KEY_PATH")).ok();
        let private_key_bytes = key_path.and_then(|p| std::fs::read(p).ok());
        let bundle = CredentialBundle {
            password,
            bearer_token: token,
            private_key_bytes,
            ..Default::default()
        };
        (!bundle.is_empty()).then_some(bundle)
    }

    fn from_secret_store(&self, key: &str) -> Result<Option<CredentialBundle>, CredentialError> {
        let Some(cmd) = self.secret_store_cmd.as_ref() else {
            return Ok(None);
        };
        let output = std::process::Command::new(cmd).arg(key).output()?;
        if !output.status.success() || output.stdout.is_empty() {
            return Ok(None);
        }
        let password = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Some(CredentialBundle {
            password: Some(password),
            ..Default::default()
        }))
    }

    fn from_credential_file(&self, key: &str) -> Result<Option<CredentialBundle>, CredentialError> {
        let Some(path) = self.credential_file.as_ref() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        check_owner_only(path)?;
        let contents = std::fs::read_to_string(path)?;
        let file: CredentialFile = serde_json::from_str(&contents)?;
        let Some(entry) = file.0.get(key) else {
            return Ok(None);
        };
        let private_key_bytes = entry
            .key_path
            .as_ref()
            .and_then(|p| std::fs::read(p).ok());
        Ok(Some(CredentialBundle {
            password: entry.password.clone(),
            bearer_token: entry.token.clone(),
            private_key_bytes,
            private_key_passphrase: None,
        }))
        .map(|b| {
            if entry.auth_method == "key" && private_key_is_missing(&b) {
                warn!(target = %key, "credential file named `key` auth but key_path was unreadable");
            }
            b
        })
    }

    fn from_interactive_prompt(&self, _key: &str) -> Option<CredentialBundle> {
        if !self.interactive || !std::io::stdin().is_terminal() {
            return None;
        }
        let password = rpassword_prompt().ok()?;
        (!password.is_empty()).then_some(CredentialBundle {
            password: Some(password),
            ..Default::default()
        })
    }
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn private_key_is_missing(b: &Option<CredentialBundle>) -> bool {
    b.as_ref().is_none_or(|b| b.private_key_bytes.is_none())
}

fn target_key(target: &ClusterTarget) -> String {
    let host = target.host.as_deref().unwrap_or("local");
    format!("{:?}_{host}", target.kind).to_ascii_uppercase()
}

fn check_owner_only(path: &Path) -> Result<(), CredentialError> {
    let meta = std::fs::metadata(path)?;
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(CredentialError::PermissionsTooOpen {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

/// Reads a line from stdin without echoing. The teacher's dependency set has
/// no terminal-raw-mode crate already in use; this shells out to `stty` the
/// way a minimal, dependency-free prompt would, restoring echo in all exit paths.
fn rpassword_prompt() -> std::io::Result<String> {
    use std::io::Write;
    print!("password: ");
    std::io::stdout().flush()?;
    let _ = std::process::Command::new("stty").arg("-echo").status();
    let mut line = String::new();
    let result = std::io::stdin().read_line(&mut line);
    let _ = std::process::Command::new("stty").arg("echo").status();
    println!();
    result?;
    Ok(line.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetKind;

    #[test]
    fn local_target_needs_no_credentials() {
        let resolver = CredentialResolver::new();
        let bundle = resolver.resolve(&ClusterTarget::local("/work")).unwrap();
        assert!(bundle.is_empty());
    }

    #[test]
    fn process_config_wins_over_env() {
        let mut target = ClusterTarget::local("/work");
        target.kind = TargetKind::Ssh;
        target.host = Some("cluster.example.com".to_string());

        let key = target_key(&target);
        let mut process = HashMap::new();
        process.insert(format!("{key}_PASSWORD"), "from-process".to_string());

        let resolver = CredentialResolver::new()
            .with_process_credentials(ProcessCredentials(process))
            .with_credential_file("/nonexistent/credentials.json");
        let bundle = resolver.resolve(&target).unwrap();
        assert_eq!(bundle.password.as_deref(), Some("from-process"));
    }

    #[test]
    fn missing_credentials_for_non_local_target_is_an_error() {
        let mut target = ClusterTarget::local("/work");
        target.kind = TargetKind::Ssh;
        target.host = Some("unreachable.example.com".to_string());

        let resolver = CredentialResolver::new().with_credential_file("/nonexistent/credentials.json");
        let err = resolver.resolve(&target).unwrap_err();
        assert!(matches!(err, CredentialError::CredentialMissing(_)));
    }

    #[test]
    fn credential_file_with_open_permissions_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "{}").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o644);
        std::fs::set_permissions(&path, perms).unwrap();

        let mut target = ClusterTarget::local("/work");
        target.kind = TargetKind::Ssh;
        target.host = Some("cluster.example.com".to_string());

        let resolver = CredentialResolver::new().with_credential_file(&path);
        let err = resolver.resolve(&target).unwrap_err();
        assert!(matches!(err, CredentialError::PermissionsTooOpen { .. }));
    }
}
