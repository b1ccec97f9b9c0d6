//! Generated remote entry point and argument codec (spec.md §6, SPEC_FULL.md §6).
//!
//! The bootstrap is real, runnable Python — not a template evaluated on the
//! Rust side — because the remote interpreter is the only thing that can load
//! `/manifest.json`'s captured source and actually call the function.

use serde::{Deserialize, Serialize};

use crate::job::ArgumentPayload;

pub const RESULT_MARKER: &str = "RESULT_JSON:";
pub const ERROR_MARKER: &str = "ERROR_JSON:";
/// Trailing sentinel the harvester uses to tell a complete write from a
/// partial one (spec.md §4.8, §6 — renamed from the original's `CLUSTRIX_END`
/// since the marker's literal text is implementation-defined).
pub const END_MARKER: &str = "OFFLOAD_END";

/// Self-describing argument envelope written to `/args.payload`. `format` is
/// always `"json-v1"` today; the tag makes a future alternate encoding additive
/// without breaking bootstraps already deployed against older bundles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgsEnvelope {
    pub format: String,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl ArgsEnvelope {
    pub fn encode(payload: &ArgumentPayload) -> Self {
        Self {
            format: "json-v1".to_string(),
            args: payload.args.clone(),
            kwargs: payload.kwargs.clone(),
        }
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Render the `/bootstrap` script implementing the 7-step contract of
/// spec.md §6. `function_name` must match the `def`/assignment the bundled
/// source defines.
pub fn generate_script(function_name: &str) -> String {
    format!(
        r#"#!/usr/bin/env python3
import json
import os
import socket
import subprocess
import sys
import traceback
from datetime import datetime, timezone

RESULT_MARKER = {result_marker:?}
ERROR_MARKER = {error_marker:?}
END_MARKER = {end_marker:?}
FUNCTION_NAME = {function_name:?}


def _read_json(path):
    with open(path, "r", encoding="utf-8") as fh:
        return json.load(fh)


def _install_external_packages(bundle_root, manifest):
    installed = {{}}
    for package in manifest.get("external_packages", []):
        try:
            __import__(package)
            installed[package] = "already-importable"
            continue
        except ImportError:
            pass
        try:
            subprocess.run(
                [sys.executable, "-m", "pip", "install", "--quiet", package],
                check=True,
                timeout=300,
            )
            installed[package] = "installed"
        except Exception as exc:  # best effort, recorded not raised
            installed[package] = f"failed: {{exc}}"
    with open(os.path.join(bundle_root, "install_report.json"), "w", encoding="utf-8") as fh:
        json.dump(installed, fh)


def _exec_source(bundle_root, relative_path, namespace):
    source_path = os.path.join(bundle_root, relative_path)
    with open(source_path, "r", encoding="utf-8") as fh:
        source = fh.read()
    exec(compile(source, source_path, "exec"), namespace)


def _load_function(bundle_root, manifest):
    namespace = {{}}
    for callee in manifest.get("dependency_report", {{}}).get("resolved_local_calls", []):
        _exec_source(bundle_root, os.path.join("sources", f"{{callee}}.py"), namespace)
    _exec_source(bundle_root, os.path.join("sources", manifest["source_file"]), namespace)
    return namespace[FUNCTION_NAME]


def _metadata(backend_id):
    return {{
        "hostname": socket.gethostname(),
        "backend_id": backend_id,
        "interpreter": "{{}}.{{}}.{{}}".format(*sys.version_info[:3]),
        "timestamp": datetime.now(timezone.utc).isoformat(),
    }}


def main():
    bundle_root = os.getcwd()
    original_cwd = os.environ.get("ORIGINAL_CWD", bundle_root)
    manifest = _read_json(os.path.join(bundle_root, "manifest.json"))
    backend_id = os.environ.get("OFFLOAD_BACKEND_ID", "unknown")

    fs_shim_dir = os.path.join(bundle_root, "fs_shim")
    if os.path.isdir(fs_shim_dir) and fs_shim_dir not in sys.path:
        sys.path.insert(0, fs_shim_dir)

    _install_external_packages(bundle_root, manifest)

    with open(os.path.join(bundle_root, "args.payload"), "r", encoding="utf-8") as fh:
        envelope = json.load(fh)
    assert envelope["format"] == "json-v1", "unsupported argument payload format"

    try:
        func = _load_function(bundle_root, manifest)
        if os.path.isdir(os.path.join(bundle_root, "data")):
            os.chdir(os.path.join(bundle_root, "data"))
        result = func(*envelope["args"], **envelope["kwargs"])
        payload = {{"status": "SUCCESS", "result": result, "metadata": _metadata(backend_id)}}
        out_path = os.path.join(original_cwd, f"result_{{FUNCTION_NAME}}_{{backend_id}}.json")
        with open(out_path, "w", encoding="utf-8") as fh:
            json.dump(payload, fh)
        print(f"{{RESULT_MARKER}}{{json.dumps(payload, separators=(',', ':'))}}")
        print(END_MARKER)
        return 0
    except Exception as exc:
        payload = {{
            "status": "ERROR",
            "error": str(exc),
            "error_type": type(exc).__name__,
            "traceback": traceback.format_exc(),
            "metadata": _metadata(backend_id),
        }}
        out_path = os.path.join(original_cwd, f"error_{{FUNCTION_NAME}}_{{backend_id}}.json")
        with open(out_path, "w", encoding="utf-8") as fh:
            json.dump(payload, fh)
        print(f"{{ERROR_MARKER}}{{json.dumps(payload, separators=(',', ':'))}}")
        print(END_MARKER)
        return 1


if __name__ == "__main__":
    sys.exit(main())
"#,
        result_marker = RESULT_MARKER,
        error_marker = ERROR_MARKER,
        end_marker = END_MARKER,
        function_name = function_name,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_embeds_function_name_and_markers() {
        let script = generate_script("add_one");
        assert!(script.contains("FUNCTION_NAME = 'add_one'") || script.contains("\"add_one\""));
        assert!(script.contains(RESULT_MARKER));
        assert!(script.contains(ERROR_MARKER));
        assert!(script.contains(END_MARKER));
    }

    #[test]
    fn args_envelope_round_trips_through_json() {
        let payload = ArgumentPayload {
            args: vec![serde_json::json!(5), serde_json::json!("x")],
            kwargs: Default::default(),
        };
        let envelope = ArgsEnvelope::encode(&payload);
        let bytes = envelope.to_json_bytes().unwrap();
        let decoded: ArgsEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.format, "json-v1");
        assert_eq!(decoded.args, payload.args);
    }
}
