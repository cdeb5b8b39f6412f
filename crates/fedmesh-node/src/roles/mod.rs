// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The three role state machines.
//!
//! Each role owns an event loop fed from a single queue: HTTP commands are
//! forwarded into it, and so are ledger observations (client) and training
//! worker results (trainer).  The overlay pushes its events over a broadcast
//! channel the loop also selects on.  Nothing outside a role loop mutates
//! its round state.

pub mod bootstrap;
pub mod client;
pub mod trainer;

use serde_json::{json, Value};

use fedmesh_p2p::{OverlayHandle, RoundMessage};

use crate::{command::Command, error::NodeError};

/// Resolves on SIGINT or SIGTERM; both trigger the same graceful drain.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Handle the commands every role answers identically.  Returns `None` for
/// role-specific commands the caller must handle itself.
pub(crate) async fn shared_command(
    overlay: &OverlayHandle,
    http: &reqwest::Client,
    bootstrap_admin: Option<&str>,
    cmd: &Command,
) -> Option<Result<Value, NodeError>> {
    match cmd {
        Command::Connect { addr } => Some(
            overlay
                .dial(addr.clone())
                .await
                .map(|()| json!({ "dialed": addr.to_string() }))
                .map_err(NodeError::from),
        ),
        Command::Mesh => Some(Ok(directory_json(overlay))),
        Command::BootMesh => Some(bootmesh(overlay, http, bootstrap_admin).await),
        Command::Peers => Some(Ok(Value::Array(
            overlay
                .directory()
                .iter()
                .filter(|r| r.addr.is_some())
                .map(|r| r.as_json())
                .collect(),
        ))),
        Command::Local => Some(
            overlay
                .local_addrs()
                .await
                .map(|addrs| json!(addrs))
                .map_err(NodeError::from),
        ),
        Command::Topics => Some(
            overlay
                .topics()
                .await
                .map(|topics| json!(topics))
                .map_err(NodeError::from),
        ),
        Command::Join { topic } => Some(
            overlay
                .subscribe(topic)
                .await
                .map(|()| json!({ "joined": topic }))
                .map_err(NodeError::from),
        ),
        Command::Leave { topic } => Some(
            overlay
                .unsubscribe(topic)
                .await
                .map(|()| json!({ "left": topic }))
                .map_err(NodeError::from),
        ),
        Command::Publish { topic, message } => Some(
            overlay
                .publish(topic, RoundMessage::Log { text: message.clone() })
                .await
                .map(|()| json!({ "published": topic }))
                .map_err(NodeError::from),
        ),
        _ => None,
    }
}

pub(crate) fn directory_json(overlay: &OverlayHandle) -> Value {
    Value::Array(overlay.directory().iter().map(|r| r.as_json()).collect())
}

/// Answer `bootmesh`: the bootstrap returns its own directory, everyone else
/// relays the query to the bootstrap's admin endpoint.
async fn bootmesh(
    overlay: &OverlayHandle,
    http: &reqwest::Client,
    bootstrap_admin: Option<&str>,
) -> Result<Value, NodeError> {
    let Some(admin) = bootstrap_admin else {
        return Ok(directory_json(overlay));
    };

    let resp = http
        .post(format!("{admin}/command"))
        .json(&json!({ "cmd": "mesh", "args": [] }))
        .send()
        .await
        .map_err(|e| NodeError::Internal(format!("bootstrap admin: {e}")))?;
    let body: Value = resp
        .json()
        .await
        .map_err(|e| NodeError::Internal(format!("bootstrap admin: {e}")))?;

    if body["status"] == "ok" {
        Ok(body["result"].clone())
    } else {
        Err(NodeError::Internal(format!(
            "bootstrap admin error: {}",
            body["error"].as_str().unwrap_or("unknown")
        )))
    }
}
