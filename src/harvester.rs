//! Result Harvester (C8, spec.md §4.8).
//!
//! Fetches the `ResultArtifact` a terminal job left behind. Backends split
//! into two shapes: file-based (SSH, batch schedulers, local — a
//! `stdout.log` plus `result_*.json`/`error_*.json` in the job's remote
//! directory) and log-based (Kubernetes — no filesystem access outside the
//! pod, so the markers embedded in the pod's stdout are the only channel).
//! Either way, completion is only trusted once the bootstrap's trailing
//! `OFFLOAD_END` marker has actually been observed, since a result file can
//! be mid-write the instant the process that wrote it exits.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

use crate::backends::{BackendAdapter, BackendError, ResultLocation};
use crate::bootstrap::{END_MARKER, ERROR_MARKER, RESULT_MARKER};
use crate::credentials::CredentialBundle;
use crate::job::{BackendHandle, FailureKind, JobSpec, ResultArtifact};
use crate::target::TargetKind;
use crate::transport::Transport;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("result artifact was not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Backoff schedule spec.md §4.8 names explicitly, in seconds.
const BACKOFF_SCHEDULE_SECS: &[u64] = &[1, 2, 4, 8, 15, 30];

pub async fn harvest(
    adapter: &dyn BackendAdapter,
    spec: &JobSpec,
    handle: &BackendHandle,
    remote_dir: &str,
    result_grace: Duration,
    transport: &Transport,
    credentials: &CredentialBundle,
) -> Result<ResultArtifact, HarvestError> {
    let locations = adapter.result_locations(handle, remote_dir);
    let start = Instant::now();
    let mut attempt = 0usize;
    let mut captured_stderr = None;

    loop {
        match try_harvest_once(spec, &locations, transport, credentials, adapter, handle, remote_dir).await {
            Ok(Some(artifact)) => return Ok(artifact),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "harvest attempt failed, retrying"),
        }

        // Pull a bounded tail each interval so a final failure carries the
        // most recent diagnostic context rather than whatever was available
        // at the very first attempt.
        if let Ok(tail) = adapter.stream_error_context(spec, handle, remote_dir, 8192).await {
            if !tail.is_empty() {
                captured_stderr = Some(tail);
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= result_grace {
            break;
        }
        let delay = Duration::from_secs(BACKOFF_SCHEDULE_SECS[attempt.min(BACKOFF_SCHEDULE_SECS.len() - 1)]);
        let remaining = result_grace - elapsed;
        tokio::time::sleep(delay.min(remaining)).await;
        attempt += 1;
        if start.elapsed() >= result_grace {
            break;
        }
    }

    Ok(ResultArtifact::Failure {
        error_kind: FailureKind::ArtifactMissing,
        message: format!(
            "no result artifact observed within the {:?} harvest grace period",
            result_grace
        ),
        remote_traceback: None,
        captured_stdout: None,
        captured_stderr,
    })
}

async fn try_harvest_once(
    spec: &JobSpec,
    locations: &ResultLocation,
    transport: &Transport,
    credentials: &CredentialBundle,
    adapter: &dyn BackendAdapter,
    handle: &BackendHandle,
    remote_dir: &str,
) -> Result<Option<ResultArtifact>, HarvestError> {
    if locations.stdout_path.is_some() {
        try_harvest_file_based(spec, locations, transport, credentials).await
    } else {
        try_harvest_log_based(spec, adapter, handle, remote_dir).await
    }
}

async fn try_harvest_file_based(
    spec: &JobSpec,
    locations: &ResultLocation,
    transport: &Transport,
    credentials: &CredentialBundle,
) -> Result<Option<ResultArtifact>, HarvestError> {
    let Some(stdout_path) = &locations.stdout_path else { return Ok(None) };
    let stdout_tail = read_text(spec, stdout_path, transport, credentials).await?;
    let Some(stdout_tail) = stdout_tail else { return Ok(None) };
    if !stdout_tail.contains(END_MARKER) {
        // Bootstrap hasn't finished writing yet; a partial file read here
        // would be indistinguishable from a genuinely missing one.
        return Ok(None);
    }

    if let Some(contents) = read_glob(spec, &locations.result_path, transport, credentials).await? {
        let parsed: SuccessPayload = serde_json::from_str(&contents)?;
        return Ok(Some(ResultArtifact::Success {
            result: parsed.result,
            metadata: parsed.metadata,
        }));
    }
    if let Some(contents) = read_glob(spec, &locations.error_path, transport, credentials).await? {
        let parsed: ErrorPayload = serde_json::from_str(&contents)?;
        return Ok(Some(ResultArtifact::Failure {
            error_kind: FailureKind::RemoteException,
            message: parsed.error,
            remote_traceback: Some(parsed.traceback),
            captured_stdout: Some(stdout_tail),
            captured_stderr: None,
        }));
    }
    // END_MARKER present but neither artifact file is readable yet; keep polling.
    Ok(None)
}

async fn try_harvest_log_based(
    spec: &JobSpec,
    adapter: &dyn BackendAdapter,
    handle: &BackendHandle,
    remote_dir: &str,
) -> Result<Option<ResultArtifact>, HarvestError> {
    let _ = spec;
    let log = adapter.stream_error_context(spec, handle, remote_dir, 65_536).await?;
    if !log.contains(END_MARKER) {
        return Ok(None);
    }
    if let Some(line) = log.lines().find(|l| l.starts_with(RESULT_MARKER)) {
        let json = &line[RESULT_MARKER.len()..];
        let parsed: SuccessPayload = serde_json::from_str(json)?;
        return Ok(Some(ResultArtifact::Success {
            result: parsed.result,
            metadata: parsed.metadata,
        }));
    }
    if let Some(line) = log.lines().find(|l| l.starts_with(ERROR_MARKER)) {
        let json = &line[ERROR_MARKER.len()..];
        let parsed: ErrorPayload = serde_json::from_str(json)?;
        return Ok(Some(ResultArtifact::Failure {
            error_kind: FailureKind::RemoteException,
            message: parsed.error,
            remote_traceback: Some(parsed.traceback),
            captured_stdout: Some(log),
            captured_stderr: None,
        }));
    }
    Ok(None)
}

#[derive(Debug, serde::Deserialize)]
struct SuccessPayload {
    result: serde_json::Value,
    metadata: crate::job::ResultMetadata,
}

#[derive(Debug, serde::Deserialize)]
struct ErrorPayload {
    error: String,
    #[allow(dead_code)]
    error_type: String,
    traceback: String,
    #[allow(dead_code)]
    metadata: crate::job::ResultMetadata,
}

async fn read_text(
    spec: &JobSpec,
    path: &str,
    transport: &Transport,
    credentials: &CredentialBundle,
) -> Result<Option<String>, HarvestError> {
    if spec.target.kind == TargetKind::Local {
        return Ok(tokio::fs::read_to_string(path).await.ok());
    }
    let result = transport
        .exec(
            &spec.target,
            credentials,
            &format!("tail -c 65536 {} 2>/dev/null", shell_escape::escape(path.into())),
            None,
            Duration::from_secs(15),
        )
        .await?;
    Ok((!result.stdout.is_empty()).then_some(result.stdout))
}

/// Expands a `result_*.json`-style glob to exactly one match and reads it,
/// since the backend advertises a pattern rather than a resolved filename.
async fn read_glob(
    spec: &JobSpec,
    glob_pattern: &str,
    transport: &Transport,
    credentials: &CredentialBundle,
) -> Result<Option<String>, HarvestError> {
    if spec.target.kind == TargetKind::Local {
        let matched = glob::glob(glob_pattern)
            .ok()
            .and_then(|mut paths| paths.find_map(Result::ok));
        let Some(path) = matched else { return Ok(None) };
        return Ok(tokio::fs::read_to_string(path).await.ok());
    }

    let listing = transport
        .exec(
            &spec.target,
            credentials,
            &format!("ls {glob_pattern} 2>/dev/null | head -n1"),
            None,
            Duration::from_secs(15),
        )
        .await?;
    let path = listing.stdout.trim();
    if path.is_empty() {
        return Ok(None);
    }
    let result = transport
        .exec(
            &spec.target,
            credentials,
            &format!("cat {}", shell_escape::escape(path.into())),
            None,
            Duration::from_secs(15),
        )
        .await?;
    Ok((!result.stdout.is_empty()).then_some(result.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_payload_parses_from_bootstrap_output_shape() {
        let json = r#"{"result":42,"metadata":{"hostname":"h","backend_id":"1","interpreter":"3.11.0","timestamp":"2024-01-01T00:00:00Z"}}"#;
        let parsed: SuccessPayload = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.result, serde_json::json!(42));
    }

    #[test]
    fn error_payload_parses_from_bootstrap_output_shape() {
        let json = r#"{"status":"ERROR","error":"boom","error_type":"ValueError","traceback":"Traceback...","metadata":{"hostname":"h","backend_id":"1","interpreter":"3.11.0","timestamp":"2024-01-01T00:00:00Z"}}"#;
        let parsed: ErrorPayload = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.error, "boom");
        assert_eq!(parsed.traceback, "Traceback...");
    }
}
