//! Bundle Packager (C4, spec.md §4.4).
//!
//! Produces a deterministic, content-addressed archive: function source,
//! metadata, callee sources, referenced data files, a generated bootstrap
//! entry script, the embedded filesystem shim, and a manifest of external
//! package requirements.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::bootstrap::{ArgsEnvelope, generate_script};
use crate::job::ArgumentPayload;
use crate::target::ClusterTarget;
use offload_analyze::{DependencyReport, normalize_source};

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("missing source for `{0}`")]
    MissingSource(String),
    #[error("data reference `{0}` is not readable")]
    UnreadableDataRef(String),
    #[error("failed to write archive: {0}")]
    ArchiveWrite(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reference to a produced bundle: enough for the executor to hand the
/// archive to a backend adapter without re-reading its contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleRef {
    pub id: String,
    pub archive_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    function_name: &'a str,
    source_file: String,
    argument_format: &'static str,
    interpreter_version: &'a str,
    dependency_report: ManifestDependencyReport,
    external_packages: Vec<String>,
    target_identity_digest: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

/// Flattened, serializable projection of [`offload_analyze::DependencyReport`].
#[derive(Debug, Serialize)]
struct ManifestDependencyReport {
    imports: Vec<String>,
    local_calls: Vec<String>,
    /// Subset of `local_calls` whose source the caller resolved and the
    /// packager embedded under `sources/{name}.py`. The bootstrap script
    /// execs these, in this order, before running the captured function.
    resolved_local_calls: Vec<String>,
    data_refs: Vec<String>,
    requires_remote_fs: bool,
}

impl ManifestDependencyReport {
    fn new(r: &DependencyReport, resolved: &BTreeMap<String, String>) -> Self {
        Self {
            imports: r.imports.iter().map(|i| i.module.clone()).collect(),
            local_calls: r.local_calls.iter().map(|c| c.name.clone()).collect(),
            resolved_local_calls: r
                .local_calls
                .iter()
                .map(|c| &c.name)
                .filter(|name| resolved.contains_key(*name))
                .cloned()
                .collect(),
            data_refs: r.data_refs.iter().map(|d| d.path.clone()).collect(),
            requires_remote_fs: r.requires_remote_fs,
        }
    }
}

/// What the caller hands the packager: the captured function source, its
/// name, and whatever data files it references by relative or absolute path
/// on the local filesystem.
pub struct PackageRequest<'a> {
    pub function_name: &'a str,
    pub function_source: &'a str,
    pub payload: ArgumentPayload,
    pub target: &'a ClusterTarget,
    pub interpreter_version: &'a str,
    /// Roots to resolve relative `data_ref`s against (typically the caller's cwd).
    pub data_search_roots: Vec<PathBuf>,
    /// Source of each `local_calls` callee the caller was able to resolve
    /// (keyed by the bare name `offload_analyze` reported). The analyzer
    /// only sees the captured function's own text, so it can name a local
    /// callee but can't read its defining file; the caller closes that gap
    /// (e.g. via `func.__globals__` in the Python-facing entry point) and
    /// hands the resolved source here. Unresolved names are simply omitted
    /// from the archive — the bootstrap fails at call time with a normal
    /// Python `NameError` rather than this packager guessing at a path.
    pub local_callee_sources: BTreeMap<String, String>,
}

pub struct BundlePackager {
    cache_root: PathBuf,
}

impl BundlePackager {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
        }
    }

    pub fn package(&self, req: &PackageRequest<'_>) -> Result<BundleRef, PackagingError> {
        let report = offload_analyze::analyze(req.function_source, req.function_name)
            .map_err(|e| PackagingError::MissingSource(e.to_string()))?;

        let normalized_source = normalize_source(req.function_source);
        let data_files = self.resolve_data_files(&report, &req.data_search_roots)?;
        let external_packages = detect_external_packages(&report);

        let args_bytes = ArgsEnvelope::encode(&req.payload).to_json_bytes()?;
        let id = compute_bundle_id(
            req.function_name,
            &normalized_source,
            &data_files,
            req.interpreter_version,
            req.target,
            &args_bytes,
            &req.local_callee_sources,
        );

        std::fs::create_dir_all(&self.cache_root)?;
        let archive_path = self.cache_root.join(format!("bundle-{id}.zst"));
        if archive_path.exists() {
            info!(bundle_id = %id, "bundle already cached, skipping rebuild");
            return Ok(BundleRef {
                id,
                archive_path,
            });
        }

        let tmp_path = self
            .cache_root
            .join(format!("bundle-{id}.zst.tmp-{}", fastrand::u64(..)));
        self.write_archive(&tmp_path, req, &report, &data_files, &external_packages, &id)?;
        std::fs::rename(&tmp_path, &archive_path)?;

        info!(bundle_id = %id, packages = external_packages.len(), "bundle packaged");
        Ok(BundleRef {
            id,
            archive_path,
        })
    }

    fn resolve_data_files(
        &self,
        report: &DependencyReport,
        search_roots: &[PathBuf],
    ) -> Result<Vec<(String, PathBuf)>, PackagingError> {
        let mut resolved = Vec::new();
        for data_ref in &report.data_refs {
            let path = Path::new(&data_ref.path);
            let found = if path.is_absolute() {
                path.exists().then(|| path.to_path_buf())
            } else {
                search_roots
                    .iter()
                    .map(|root| root.join(path))
                    .find(|p| p.exists())
            };
            if let Some(found) = found {
                resolved.push((data_ref.path.clone(), found));
            }
            // A data_ref that doesn't exist locally isn't necessarily an error:
            // it may be produced remotely. Only fail if the call site required it.
        }
        Ok(resolved)
    }

    fn write_archive(
        &self,
        path: &Path,
        req: &PackageRequest<'_>,
        report: &DependencyReport,
        data_files: &[(String, PathBuf)],
        external_packages: &[String],
        bundle_id: &str,
    ) -> Result<(), PackagingError> {
        let mut builder = tar::Builder::new(Vec::new());

        let manifest = Manifest {
            function_name: req.function_name,
            source_file: "function.py".to_string(),
            argument_format: "json-v1",
            interpreter_version: req.interpreter_version,
            dependency_report: ManifestDependencyReport::new(report, &req.local_callee_sources),
            external_packages: external_packages.to_vec(),
            target_identity_digest: req.target.identity_digest(),
            created_at: chrono::Utc::now(),
        };
        append_bytes(
            &mut builder,
            "manifest.json",
            &serde_json::to_vec_pretty(&manifest)?,
        )?;
        append_bytes(
            &mut builder,
            "target.json",
            &serde_json::to_vec_pretty(req.target)?,
        )?;
        append_bytes(
            &mut builder,
            "sources/function.py",
            normalize_source(req.function_source).as_bytes(),
        )?;

        for call in &report.local_calls {
            if let Some(source) = req.local_callee_sources.get(&call.name) {
                append_bytes(
                    &mut builder,
                    &format!("sources/{}.py", call.name),
                    normalize_source(source).as_bytes(),
                )?;
            }
        }

        for (relative, local) in data_files {
            let arcname = if Path::new(relative).is_absolute() {
                format!(
                    "data/{}",
                    Path::new(relative)
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("data")
                )
            } else {
                format!("data/{relative}")
            };
            let contents = std::fs::read(local)
                .map_err(|_| PackagingError::UnreadableDataRef(relative.clone()))?;
            append_bytes(&mut builder, &arcname, &contents)?;
        }

        append_bytes(
            &mut builder,
            "fs_shim/offload_fs.py",
            FS_SHIM_SOURCE.as_bytes(),
        )?;
        append_bytes(
            &mut builder,
            "bootstrap",
            generate_script(req.function_name).as_bytes(),
        )?;

        let envelope = ArgsEnvelope::encode(&req.payload);
        append_bytes(&mut builder, "args.payload", &envelope.to_json_bytes()?)?;

        let tar_bytes = builder
            .into_inner()
            .map_err(|e| PackagingError::ArchiveWrite(e.to_string()))?;

        let compressed = zstd::encode_all(tar_bytes.as_slice(), 0)
            .map_err(|e| PackagingError::ArchiveWrite(e.to_string()))?;

        let mut file = std::fs::File::create(path)?;
        file.write_all(&compressed)?;
        let _ = bundle_id; // id already encoded in the file name by the caller
        Ok(())
    }
}

fn append_bytes(
    builder: &mut tar::Builder<Vec<u8>>,
    path: &str,
    contents: &[u8],
) -> Result<(), PackagingError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, path, contents)
        .map_err(|e| PackagingError::ArchiveWrite(e.to_string()))
}

/// spec.md §4.4 step 5: the stdlib allowlist and alias table grounded on
/// `clustrix/file_packaging.py::_get_stdlib_modules` / `_map_module_to_package`.
const STDLIB_MODULES: &[&str] = &[
    "os", "sys", "re", "json", "math", "random", "itertools", "functools", "collections",
    "datetime", "time", "pathlib", "typing", "abc", "io", "copy", "csv", "enum", "glob",
    "hashlib", "logging", "pickle", "shutil", "socket", "sqlite3", "string", "subprocess",
    "tempfile", "threading", "traceback", "unittest", "urllib", "uuid", "warnings", "xml", "zlib",
    "dataclasses", "contextlib", "asyncio", "multiprocessing", "argparse", "base64",
];

const ALIAS_TO_PACKAGE: &[(&str, &str)] = &[
    ("np", "numpy"),
    ("pd", "pandas"),
    ("sklearn", "scikit-learn"),
    ("cv2", "opencv-python"),
    ("PIL", "Pillow"),
    ("yaml", "PyYAML"),
    ("plt", "matplotlib"),
    ("tf", "tensorflow"),
];

fn detect_external_packages(report: &DependencyReport) -> Vec<String> {
    let mut packages: BTreeSet<String> = BTreeSet::new();
    for import in &report.imports {
        let top_level = import.module.split('.').next().unwrap_or(&import.module);
        if top_level.is_empty() || top_level.starts_with('.') {
            continue; // relative import, not external
        }
        if STDLIB_MODULES.contains(&top_level) {
            continue;
        }
        let package = ALIAS_TO_PACKAGE
            .iter()
            .find(|(alias, _)| *alias == top_level)
            .map(|(_, pkg)| pkg.to_string())
            .unwrap_or_else(|| top_level.to_string());
        packages.insert(package);
    }
    packages.into_iter().collect()
}

/// Bundle id: truncated SHA-256 over the canonical inputs named in spec.md §3.
/// Includes the encoded argument payload — two calls to the same function
/// with different arguments must land in distinct remote directories rather
/// than share a cached archive and silently reuse the wrong args.
fn compute_bundle_id(
    function_name: &str,
    normalized_source: &str,
    data_files: &[(String, PathBuf)],
    interpreter_version: &str,
    target: &ClusterTarget,
    args_bytes: &[u8],
    local_callee_sources: &BTreeMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(function_name);
    hasher.update(normalized_source);
    hasher.update(args_bytes);
    for (name, source) in local_callee_sources {
        hasher.update(name);
        hasher.update(normalize_source(source));
    }

    let mut data_hashes: Vec<String> = data_files
        .iter()
        .map(|(rel, path)| {
            let contents = std::fs::read(path).unwrap_or_default();
            let mut h = Sha256::new();
            h.update(rel);
            h.update(&contents);
            format!("{:x}", h.finalize())
        })
        .collect();
    data_hashes.sort();
    for h in &data_hashes {
        hasher.update(h);
    }

    hasher.update(interpreter_version);
    hasher.update(target.identity_digest());

    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// The filesystem-abstraction shim, embedded verbatim into every bundle so
/// user code running remotely sees the same API as [`crate::fs_abstraction`].
pub(crate) const FS_SHIM_SOURCE: &str = r#"import glob as _glob
import json
import os


def _load_target():
    with open("target.json", "r", encoding="utf-8") as fh:
        return json.load(fh)


def cluster_ls(path="."):
    return sorted(os.listdir(path))


def cluster_find(pattern, path="."):
    return sorted(_glob.glob(os.path.join(path, "**", pattern), recursive=True))


def cluster_glob(pattern, path="."):
    return sorted(_glob.glob(os.path.join(path, pattern)))


def cluster_stat(path):
    st = os.stat(path)
    return {
        "size": st.st_size,
        "mtime": st.st_mtime,
        "is_dir": os.path.isdir(path),
        "is_file": os.path.isfile(path),
        "mode": st.st_mode,
    }


def cluster_exists(path):
    return os.path.exists(path)


def cluster_isdir(path):
    return os.path.isdir(path)


def cluster_isfile(path):
    return os.path.isfile(path)


def cluster_du(path):
    total = 0
    for root, _dirs, files in os.walk(path):
        for name in files:
            total += os.path.getsize(os.path.join(root, name))
    return total


def cluster_count_files(path, pattern="*"):
    return len(_glob.glob(os.path.join(path, pattern)))
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(
        source: &'a str,
        target: &'a ClusterTarget,
        payload: ArgumentPayload,
    ) -> PackageRequest<'a> {
        PackageRequest {
            function_name: "add",
            function_source: source,
            payload,
            target,
            interpreter_version: "3.11",
            data_search_roots: vec![],
            local_callee_sources: BTreeMap::new(),
        }
    }

    #[test]
    fn identical_inputs_produce_identical_bundle_id() {
        let dir = tempfile::tempdir().unwrap();
        let packager = BundlePackager::new(dir.path());
        let target = ClusterTarget::local("/work");
        let source = "def add(a, b):\n    return a + b\n";

        let r1 = packager
            .package(&request(source, &target, ArgumentPayload::default()))
            .unwrap();
        let r2 = packager
            .package(&request(source, &target, ArgumentPayload::default()))
            .unwrap();
        assert_eq!(r1.id, r2.id);
        assert_eq!(r1.archive_path, r2.archive_path);
    }

    #[test]
    fn whitespace_only_change_does_not_alter_bundle_id() {
        let dir = tempfile::tempdir().unwrap();
        let packager = BundlePackager::new(dir.path());
        let target = ClusterTarget::local("/work");

        let r1 = packager
            .package(&request(
                "def add(a, b):\n    return a + b\n",
                &target,
                ArgumentPayload::default(),
            ))
            .unwrap();
        let r2 = packager
            .package(&request(
                "  def add(a, b):\n      return a + b\n",
                &target,
                ArgumentPayload::default(),
            ))
            .unwrap();
        assert_eq!(r1.id, r2.id);
    }

    #[test]
    fn external_packages_exclude_stdlib_and_map_aliases() {
        let source = "def f():\n    import os\n    import numpy as np\n    return np.array([1])\n";
        let report = offload_analyze::analyze(source, "f").unwrap();
        let packages = detect_external_packages(&report);
        assert_eq!(packages, vec!["numpy".to_string()]);
    }

    #[test]
    fn resolved_local_callee_source_is_embedded_and_affects_bundle_id() {
        let dir = tempfile::tempdir().unwrap();
        let packager = BundlePackager::new(dir.path());
        let target = ClusterTarget::local("/work");
        let source = "def add(a, b):\n    return helper(a) + b\n";

        let mut without_callee = request(source, &target, ArgumentPayload::default());
        let r1 = packager.package(&without_callee).unwrap();

        without_callee.local_callee_sources.insert(
            "helper".to_string(),
            "def helper(x):\n    return x * 2\n".to_string(),
        );
        let r2 = packager.package(&without_callee).unwrap();

        assert_ne!(r1.id, r2.id, "embedding callee source must change the bundle id");

        let bytes = std::fs::read(&r2.archive_path).unwrap();
        let tar_bytes = zstd::decode_all(bytes.as_slice()).unwrap();
        let mut archive = tar::Archive::new(tar_bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"sources/helper.py".to_string()));
    }

    #[test]
    fn archive_is_written_to_cache_root() {
        let dir = tempfile::tempdir().unwrap();
        let packager = BundlePackager::new(dir.path());
        let target = ClusterTarget::local("/work");
        let bundle = packager
            .package(&request(
                "def add(a, b):\n    return a + b\n",
                &target,
                ArgumentPayload::default(),
            ))
            .unwrap();
        assert!(bundle.archive_path.exists());
    }
}
