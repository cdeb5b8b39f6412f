// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Runs the opaque model artifact on one dataset chunk.
//!
//! The model is whatever executable the data owner uploaded; the contract
//! here is minimal: the artifact is invoked with the chunk file path as its
//! only argument and must write the resulting weights to stdout.  A non-zero
//! exit or a timeout fails the chunk.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::NodeError;

/// Wall-clock budget for one chunk of training.
pub const DEFAULT_TRAIN_TIMEOUT: Duration = Duration::from_secs(600);

/// Execute `model` on `chunk`, returning the produced weights bytes.
///
/// `scratch` receives the materialized artifact and chunk under `tag`; the
/// caller owns the directory's lifetime (one per round, removed with it).
pub async fn run_model(
    scratch: &Path,
    tag: &str,
    model: &[u8],
    chunk: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, NodeError> {
    let dir = scratch.join(tag);
    tokio::fs::create_dir_all(&dir).await.map_err(io_err)?;

    let model_path = dir.join("model");
    let chunk_path = dir.join("chunk.csv");

    let mut f = tokio::fs::File::create(&model_path).await.map_err(io_err)?;
    f.write_all(model).await.map_err(io_err)?;
    f.flush().await.map_err(io_err)?;
    drop(f);
    tokio::fs::write(&chunk_path, chunk).await.map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        tokio::fs::set_permissions(&model_path, perms)
            .await
            .map_err(io_err)?;
    }

    let child = Command::new(&model_path)
        .arg(&chunk_path)
        .current_dir(&dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| NodeError::Training(format!("model timed out after {timeout:?}")))?
        .map_err(|e| NodeError::Training(format!("failed to start model: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let excerpt: String = stderr.chars().take(256).collect();
        return Err(NodeError::Training(format!(
            "model exited with {}: {excerpt}",
            output.status
        )));
    }
    if output.stdout.is_empty() {
        return Err(NodeError::Training("model produced no weights on stdout".into()));
    }

    Ok(output.stdout)
}

fn io_err(e: std::io::Error) -> NodeError {
    NodeError::Training(format!("scratch dir: {e}"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const ECHO_MODEL: &[u8] = b"#!/bin/sh\ncat \"$1\"\n";
    const FAILING_MODEL: &[u8] = b"#!/bin/sh\necho boom >&2\nexit 3\n";

    #[tokio::test]
    async fn model_output_becomes_the_weights() {
        let scratch = tempfile::tempdir().unwrap();
        let chunk = b"id,label\n1,0\n2,1\n";
        let weights = run_model(scratch.path(), "t1-c0", ECHO_MODEL, chunk, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(weights, chunk);
    }

    #[tokio::test]
    async fn non_zero_exit_fails_the_chunk_with_stderr() {
        let scratch = tempfile::tempdir().unwrap();
        let err = run_model(scratch.path(), "t1-c1", FAILING_MODEL, b"x\n", Duration::from_secs(10))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("boom"), "stderr must be surfaced: {msg}");
    }

    #[tokio::test]
    async fn hung_model_times_out() {
        let scratch = tempfile::tempdir().unwrap();
        let sleeper = b"#!/bin/sh\nsleep 30\n";
        let err = run_model(scratch.path(), "t1-c2", sleeper, b"x\n", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
