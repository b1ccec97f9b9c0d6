//! Filesystem Abstraction (C5, spec.md §4.5).
//!
//! The enumerated read-only API used both by user code and by the Result
//! Harvester. Dispatches to native syscalls for a `local` target, or to
//! `Transport::exec` with small shell one-liners otherwise — the same split
//! the embedded bundle shim (`bundle.rs::FS_SHIM_SOURCE`) makes from inside
//! the remote interpreter.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::credentials::CredentialBundle;
use crate::target::{ClusterTarget, TargetKind};
use crate::transport::Transport;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("transport error: {0}")]
    TransportError(#[from] crate::transport::TransportError),
}

#[derive(Debug, Clone)]
pub struct FileStat {
    pub size: u64,
    pub mtime: u64,
    pub is_dir: bool,
    pub is_file: bool,
    pub mode: u32,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    target: String,
    path: String,
    op: &'static str,
    args: String,
}

enum CacheEntry {
    Listing(Vec<String>),
    Stat(FileStatCacheable),
    Bool(bool),
    Size(u64),
}

#[derive(Clone)]
struct FileStatCacheable {
    size: u64,
    mtime: u64,
    is_dir: bool,
    is_file: bool,
    mode: u32,
}

const CACHE_TTL: Duration = Duration::from_secs(5);

pub struct FsAbstraction {
    transport: Transport,
    credentials: CredentialBundle,
    cache: Mutex<HashMap<CacheKey, (Instant, CacheEntry)>>,
}

impl FsAbstraction {
    pub fn new(transport: Transport, credentials: CredentialBundle) -> Self {
        Self { transport, credentials, cache: Mutex::new(HashMap::new()) }
    }

    async fn cached_or<F, Fut>(
        &self,
        target: &ClusterTarget,
        path: &str,
        op: &'static str,
        args: &str,
        compute: F,
    ) -> Result<CacheEntry, FsError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CacheEntry, FsError>>,
    {
        let key = CacheKey {
            target: target.identity_digest(),
            path: path.to_string(),
            op,
            args: args.to_string(),
        };
        {
            let cache = self.cache.lock().await;
            if let Some((stamp, entry)) = cache.get(&key) {
                if stamp.elapsed() < CACHE_TTL {
                    return Ok(clone_entry(entry));
                }
            }
        }
        let entry = compute().await?;
        let mut cache = self.cache.lock().await;
        cache.insert(key, (Instant::now(), clone_entry(&entry)));
        Ok(entry)
    }

    /// Drops every cached entry, per spec.md §4.5's explicit `refresh`.
    pub async fn refresh(&self) {
        self.cache.lock().await.clear();
    }

    pub async fn list(&self, target: &ClusterTarget, path: &str) -> Result<Vec<String>, FsError> {
        let entry = self
            .cached_or(target, path, "list", "", || async {
                let mut names = if target.kind == TargetKind::Local {
                    list_local(path)?
                } else {
                    self.list_remote(target, path).await?
                };
                names.sort();
                Ok(CacheEntry::Listing(names))
            })
            .await?;
        Ok(unwrap_listing(entry))
    }

    pub async fn find(
        &self,
        target: &ClusterTarget,
        pattern: &str,
        path: &str,
    ) -> Result<Vec<String>, FsError> {
        let args = pattern.to_string();
        let entry = self
            .cached_or(target, path, "find", &args, || async {
                let mut names = if target.kind == TargetKind::Local {
                    find_local(pattern, path)?
                } else {
                    self.exec_listing(
                        target,
                        &format!(
                            "find {path} -name {} 2>/dev/null | sort",
                            shell_escape::escape(pattern.into())
                        ),
                    )
                    .await?
                };
                names.sort();
                Ok(CacheEntry::Listing(names))
            })
            .await?;
        Ok(unwrap_listing(entry))
    }

    pub async fn glob(
        &self,
        target: &ClusterTarget,
        pattern: &str,
        path: &str,
    ) -> Result<Vec<String>, FsError> {
        let args = pattern.to_string();
        let entry = self
            .cached_or(target, path, "glob", &args, || async {
                let mut names = if target.kind == TargetKind::Local {
                    glob_local(pattern, path)?
                } else {
                    self.exec_listing(
                        target,
                        &format!("cd {path} 2>/dev/null && ls -d {pattern} 2>/dev/null | sort"),
                    )
                    .await?
                };
                names.sort();
                Ok(CacheEntry::Listing(names))
            })
            .await?;
        Ok(unwrap_listing(entry))
    }

    pub async fn stat(&self, target: &ClusterTarget, path: &str) -> Result<FileStat, FsError> {
        let entry = self
            .cached_or(target, path, "stat", "", || async {
                if target.kind == TargetKind::Local {
                    stat_local(path).map(CacheEntry::Stat)
                } else {
                    let info = self.transport.stat(target, &self.credentials, path).await?;
                    Ok(CacheEntry::Stat(FileStatCacheable {
                        size: info.size,
                        mtime: info.mtime,
                        is_dir: info.is_dir,
                        is_file: info.is_file,
                        mode: info.mode,
                    }))
                }
            })
            .await?;
        match entry {
            CacheEntry::Stat(s) => Ok(FileStat { size: s.size, mtime: s.mtime, is_dir: s.is_dir, is_file: s.is_file, mode: s.mode }),
            _ => unreachable!(),
        }
    }

    pub async fn exists(&self, target: &ClusterTarget, path: &str) -> Result<bool, FsError> {
        match self.stat(target, path).await {
            Ok(_) => Ok(true),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn is_dir(&self, target: &ClusterTarget, path: &str) -> Result<bool, FsError> {
        Ok(self.stat(target, path).await.map(|s| s.is_dir).unwrap_or(false))
    }

    pub async fn is_file(&self, target: &ClusterTarget, path: &str) -> Result<bool, FsError> {
        Ok(self.stat(target, path).await.map(|s| s.is_file).unwrap_or(false))
    }

    pub async fn tree_size(&self, target: &ClusterTarget, path: &str) -> Result<u64, FsError> {
        let entry = self
            .cached_or(target, path, "tree_size", "", || async {
                let size = if target.kind == TargetKind::Local {
                    tree_size_local(path)?
                } else {
                    let result = self
                        .transport
                        .exec(
                            target,
                            &self.credentials,
                            &format!("du -sb {path} 2>/dev/null | cut -f1"),
                            None,
                            Duration::from_secs(30),
                        )
                        .await?;
                    result.stdout.trim().parse().unwrap_or(0)
                };
                Ok(CacheEntry::Size(size))
            })
            .await?;
        match entry {
            CacheEntry::Size(s) => Ok(s),
            _ => unreachable!(),
        }
    }

    pub async fn count(&self, target: &ClusterTarget, path: &str, pattern: &str) -> Result<u64, FsError> {
        Ok(self.glob(target, pattern, path).await?.len() as u64)
    }

    async fn list_remote(&self, target: &ClusterTarget, path: &str) -> Result<Vec<String>, FsError> {
        self.exec_listing(target, &format!("ls -1a {path} 2>/dev/null")).await
    }

    async fn exec_listing(&self, target: &ClusterTarget, command: &str) -> Result<Vec<String>, FsError> {
        let result = self
            .transport
            .exec(target, &self.credentials, command, None, Duration::from_secs(20))
            .await?;
        Ok(result
            .stdout
            .lines()
            .map(str::to_string)
            .filter(|l| l != "." && l != "..")
            .collect())
    }
}

fn clone_entry(entry: &CacheEntry) -> CacheEntry {
    match entry {
        CacheEntry::Listing(v) => CacheEntry::Listing(v.clone()),
        CacheEntry::Stat(s) => CacheEntry::Stat(s.clone()),
        CacheEntry::Bool(b) => CacheEntry::Bool(*b),
        CacheEntry::Size(s) => CacheEntry::Size(*s),
    }
}

fn unwrap_listing(entry: CacheEntry) -> Vec<String> {
    match entry {
        CacheEntry::Listing(v) => v,
        _ => Vec::new(),
    }
}

fn list_local(path: &str) -> Result<Vec<String>, FsError> {
    let entries = std::fs::read_dir(path).map_err(|e| map_io_err(path, e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| FsError::TransportError(crate::transport::TransportError::Protocol(e.to_string())))?;
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    Ok(names)
}

fn find_local(pattern: &str, path: &str) -> Result<Vec<String>, FsError> {
    let mut results = Vec::new();
    walk(Path::new(path), &mut |p| {
        if p.file_name()
            .and_then(|n| n.to_str())
            .map(|n| glob_match(pattern, n))
            .unwrap_or(false)
        {
            results.push(p.to_string_lossy().to_string());
        }
    });
    Ok(results)
}

fn glob_local(pattern: &str, path: &str) -> Result<Vec<String>, FsError> {
    let full = format!("{}/{pattern}", path.trim_end_matches('/'));
    glob::glob(&full)
        .map_err(|e| FsError::TransportError(crate::transport::TransportError::Protocol(e.to_string())))?
        .filter_map(Result::ok)
        .map(|p| Ok(p.to_string_lossy().to_string()))
        .collect()
}

fn stat_local(path: &str) -> Result<FileStatCacheable, FsError> {
    let meta = std::fs::metadata(path).map_err(|e| map_io_err(path, e))?;
    Ok(FileStatCacheable {
        size: meta.len(),
        mtime: meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0),
        is_dir: meta.is_dir(),
        is_file: meta.is_file(),
        #[cfg(unix)]
        mode: std::os::unix::fs::PermissionsExt::mode(&meta.permissions()),
        #[cfg(not(unix))]
        mode: 0,
    })
}

fn tree_size_local(path: &str) -> Result<u64, FsError> {
    let mut total = 0u64;
    walk(Path::new(path), &mut |p| {
        if let Ok(meta) = std::fs::metadata(p) {
            if meta.is_file() {
                total += meta.len();
            }
        }
    });
    Ok(total)
}

fn walk(root: &Path, visit: &mut impl FnMut(&Path)) {
    let Ok(entries) = std::fs::read_dir(root) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        visit(&path);
        if path.is_dir() {
            walk(&path, visit);
        }
    }
}

fn glob_match(pattern: &str, name: &str) -> bool {
    glob::Pattern::new(pattern).map(|p| p.matches(name)).unwrap_or(false)
}

fn map_io_err(path: &str, e: std::io::Error) -> FsError {
    match e.kind() {
        std::io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        std::io::ErrorKind::PermissionDenied => FsError::PermissionDenied(path.to_string()),
        _ => FsError::TransportError(crate::transport::TransportError::Protocol(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_list_and_stat_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"hello").unwrap();

        let fs = FsAbstraction::new(Transport::new(), CredentialBundle::default());
        let target = ClusterTarget::local(dir.path().to_string_lossy());

        let names = fs.list(&target, &dir.path().to_string_lossy()).await.unwrap();
        assert_eq!(names.len(), 2);

        let stat = fs
            .stat(&target, &dir.path().join("b.txt").to_string_lossy())
            .await
            .unwrap();
        assert_eq!(stat.size, 5);
        assert!(stat.is_file);
    }

    #[tokio::test]
    async fn missing_path_reports_not_found() {
        let fs = FsAbstraction::new(Transport::new(), CredentialBundle::default());
        let target = ClusterTarget::local("/nonexistent");
        let err = fs.stat(&target, "/nonexistent/x").await.unwrap_err();
        assert!(matches!(err, FsError::NotFound(_)));
    }

    #[tokio::test]
    async fn cache_serves_repeat_reads_without_recomputation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        let fs = FsAbstraction::new(Transport::new(), CredentialBundle::default());
        let target = ClusterTarget::local(dir.path().to_string_lossy());

        let first = fs.list(&target, &dir.path().to_string_lossy()).await.unwrap();
        std::fs::write(dir.path().join("b.txt"), b"new").unwrap();
        let second = fs.list(&target, &dir.path().to_string_lossy()).await.unwrap();
        assert_eq!(first, second);

        fs.refresh().await;
        let third = fs.list(&target, &dir.path().to_string_lossy()).await.unwrap();
        assert_eq!(third.len(), 2);
    }
}
