//! Transport (C2, spec.md §4.2): authenticated command/file transport over SSH.
//!
//! Adapted from the teacher's `ssh.rs` session-cache pattern, generalized to
//! the pooling, backoff, and timeout policy spec.md §4.2 and §5 demand: one
//! live connection per `(host, port, username)`, idempotent-only retry with
//! exponential backoff, and a soft wall-clock per `exec` that kills the
//! remote process through a side channel rather than just dropping the future.

use std::collections::HashMap;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use openssh_sftp_client::Sftp;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::credentials::CredentialBundle;
use crate::target::ClusterTarget;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("authentication failed for {0}")]
    AuthFailed(String),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<openssh::Error> for TransportError {
    fn from(e: openssh::Error) -> Self {
        match &e {
            openssh::Error::Connect(_) => TransportError::Unreachable(e.to_string()),
            _ => TransportError::Protocol(e.to_string()),
        }
    }
}

impl From<openssh_sftp_client::Error> for TransportError {
    fn from(e: openssh_sftp_client::Error) -> Self {
        TransportError::Protocol(e.to_string())
    }
}

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub size: u64,
    pub mtime: u64,
    pub is_dir: bool,
    pub is_file: bool,
    pub mode: u32,
}

/// One entry per `(host, port, username)`. The pool caps one live connection
/// per key; callers serialize through the `RwLock` rather than through an
/// explicit ready-queue, since `openssh::Session` multiplexes channels itself.
type SessionPool = Arc<RwLock<HashMap<String, Arc<Session>>>>;

#[derive(Clone)]
pub struct Transport {
    pool: SessionPool,
}

impl Transport {
    pub fn new() -> Self {
        Self {
            pool: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn pool_key(target: &ClusterTarget) -> String {
        format!(
            "{}:{}:{}",
            target.host.as_deref().unwrap_or(""),
            target.port.unwrap_or(22),
            target.username.as_deref().unwrap_or("")
        )
    }

    /// Reconnects with exponential backoff (base 0.5s, cap 8s, max 5 attempts)
    /// on transport error, per spec.md §4.2.
    async fn get_session(
        &self,
        target: &ClusterTarget,
        creds: &CredentialBundle,
    ) -> Result<Arc<Session>, TransportError> {
        let key = Self::pool_key(target);
        {
            let pool = self.pool.read().await;
            if let Some(session) = pool.get(&key) {
                return Ok(session.clone());
            }
        }

        let mut delay = Duration::from_millis(500);
        let mut last_err = None;
        for attempt in 1..=5 {
            match self.connect(target, creds).await {
                Ok(session) => {
                    let mut pool = self.pool.write().await;
                    let session = Arc::new(session);
                    pool.insert(key, session.clone());
                    return Ok(session);
                }
                Err(e) => {
                    warn!(attempt, host = ?target.host, error = %e, "ssh connect failed, retrying");
                    last_err = Some(e);
                    if attempt < 5 {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(8));
                    }
                }
            }
        }
        Err(last_err.unwrap_or(TransportError::Unreachable(key)))
    }

    async fn connect(
        &self,
        target: &ClusterTarget,
        creds: &CredentialBundle,
    ) -> Result<Session, TransportError> {
        info!(host = ?target.host, "establishing transport connection");
        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(KnownHosts::Accept);
        builder.connect_timeout(target.connect_timeout);
        if let Some(port) = target.port {
            builder.port(port);
        }
        if let Some(user) = &target.username {
            builder.user(user.clone());
        }

        // openssh shells out to the system `ssh` binary, which only takes a
        // keyfile path, not in-memory key bytes — materialize the resolved
        // key to an owner-only temp file before connecting, same discipline
        // as the owner-only check this bundle's source file already applies.
        // Keep the guard alive until `connect` returns so the file still
        // exists while the `ssh` process reads it.
        let _keyfile_guard = if let Some(key_bytes) = &creds.private_key_bytes {
            let mut tmp = tempfile::NamedTempFile::new().map_err(|e| {
                TransportError::AuthFailed(format!("could not materialize private key: {e}"))
            })?;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(|e| {
                    TransportError::AuthFailed(format!("could not set private key permissions: {e}"))
                })?;
            tmp.write_all(key_bytes).map_err(|e| {
                TransportError::AuthFailed(format!("could not write private key: {e}"))
            })?;
            tmp.flush().map_err(|e| {
                TransportError::AuthFailed(format!("could not flush private key: {e}"))
            })?;
            builder.keyfile(tmp.path());
            Some(tmp)
        } else if creds.password.is_some() || creds.bearer_token.is_some() {
            return Err(TransportError::AuthFailed(format!(
                "resolved credentials for {:?} carry a password or bearer token, but the ssh \
                 transport only supports key-based auth; supply a private key or fall back to \
                 ambient ssh-agent/host identity",
                target.host
            )));
        } else {
            None
        };

        let destination = target.host.as_deref().unwrap_or("localhost").to_string();
        builder.connect(&destination).await.map_err(Into::into)
    }

    pub async fn exec(
        &self,
        target: &ClusterTarget,
        creds: &CredentialBundle,
        command: &str,
        stdin_data: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecResult, TransportError> {
        let session = self.get_session(target, creds).await?;
        let run = async {
            let mut cmd = session.command("sh");
            cmd.arg("-c").arg(command);
            cmd.stdin(if stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());

            let mut child = cmd.spawn().await?;
            if let Some(data) = stdin_data {
                if let Some(mut stdin) = child.stdin().take() {
                    let _ = stdin.write_all(data.as_bytes()).await;
                }
            }

            let stdout_handle = child.stdout().take();
            let stderr_handle = child.stderr().take();
            let stdout_task = tokio::spawn(read_lines(stdout_handle));
            let stderr_task = tokio::spawn(read_lines(stderr_handle));

            let status = child.wait().await?;
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();

            Ok::<_, openssh::Error>(ExecResult {
                stdout,
                stderr,
                exit_code: status.code().unwrap_or(-1),
            })
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!(?timeout, "exec timed out, discarding pooled session");
                self.evict(target).await;
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    async fn evict(&self, target: &ClusterTarget) {
        let key = Self::pool_key(target);
        let mut pool = self.pool.write().await;
        pool.remove(&key);
    }

    pub async fn upload(
        &self,
        target: &ClusterTarget,
        creds: &CredentialBundle,
        local_path: &std::path::Path,
        remote_path: &str,
    ) -> Result<(), TransportError> {
        let session = self.get_session(target, creds).await?;
        let contents = tokio::fs::read(local_path)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let sftp = Sftp::from_clonable_session(session, Default::default()).await?;
        let mut remote_file = sftp.create(remote_path).await?;
        remote_file.write_all(&contents).await?;
        remote_file.close().await?;
        sftp.close().await?;
        Ok(())
    }

    /// Idempotent: safe to retry on transient error (spec.md §4.2, §7).
    pub async fn download(
        &self,
        target: &ClusterTarget,
        creds: &CredentialBundle,
        remote_path: &str,
        local_path: &std::path::Path,
    ) -> Result<(), TransportError> {
        let mut delay = Duration::from_millis(500);
        for attempt in 1..=3 {
            match self
                .download_once(target, creds, remote_path, local_path)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt < 3 => {
                    warn!(attempt, error = %e, "download failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(8));
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!()
    }

    async fn download_once(
        &self,
        target: &ClusterTarget,
        creds: &CredentialBundle,
        remote_path: &str,
        local_path: &std::path::Path,
    ) -> Result<(), TransportError> {
        let session = self.get_session(target, creds).await?;
        let sftp = Sftp::from_clonable_session(session, Default::default()).await?;
        let mut remote_file = sftp.open(remote_path).await?;
        let mut contents = Vec::new();
        loop {
            let buf = BytesMut::with_capacity(8192);
            match remote_file.read(8192, buf).await? {
                Some(data) => contents.extend_from_slice(&data),
                None => break,
            }
        }
        remote_file.close().await?;
        sftp.close().await?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
        }
        tokio::fs::write(local_path, &contents)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        Ok(())
    }

    /// Idempotent status read (spec.md §4.2).
    pub async fn stat(
        &self,
        target: &ClusterTarget,
        creds: &CredentialBundle,
        remote_path: &str,
    ) -> Result<FileInfo, TransportError> {
        let result = self
            .exec(
                target,
                creds,
                &format!("stat -c '%s %Y %F' {}", shell_escape::escape(remote_path.into())),
                None,
                Duration::from_secs(15),
            )
            .await?;
        if result.exit_code != 0 {
            return Err(TransportError::Protocol(result.stderr));
        }
        parse_stat_line(&result.stdout)
    }

    pub async fn close_all(&self) {
        let mut pool = self.pool.write().await;
        for (key, _session) in pool.drain() {
            info!(key = %key, "closing transport connection");
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_lines(handle: Option<openssh::process::ChildStdout>) -> String {
    let mut lines_collected = Vec::new();
    if let Some(stdout) = handle {
        let reader = BufReader::new(stdout);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            lines_collected.push(line);
        }
    }
    lines_collected.join("\n")
}

fn parse_stat_line(line: &str) -> Result<FileInfo, TransportError> {
    let trimmed = line.trim();
    let mut parts = trimmed.split_whitespace();
    let size = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransportError::Protocol(format!("unparseable stat output: {trimmed}")))?;
    let mtime = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransportError::Protocol(format!("unparseable stat output: {trimmed}")))?;
    let kind = parts.next().unwrap_or("");
    Ok(FileInfo {
        size,
        mtime,
        is_dir: kind == "directory",
        is_file: kind == "regular file" || kind == "regular empty file",
        mode: 0o644,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stat_output() {
        let info = parse_stat_line("1024 1700000000 regular file").unwrap();
        assert_eq!(info.size, 1024);
        assert!(info.is_file);
        assert!(!info.is_dir);
    }

    #[test]
    fn pool_key_combines_host_port_user() {
        let mut target = ClusterTarget::local("/work");
        target.host = Some("cluster.example.com".to_string());
        target.port = Some(2222);
        target.username = Some("alice".to_string());
        assert_eq!(Transport::pool_key(&target), "cluster.example.com:2222:alice");
    }
}
