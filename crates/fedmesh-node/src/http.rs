// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! HTTP control surface.
//!
//! A thin shim between the UI's JSON and the role state machine: commands
//! are parsed here, queued to the role loop, and answered from its oneshot
//! reply.  Commands are serialized — one outstanding command per node — so
//! the state machine stays deterministic under concurrent UI requests.
//!
//! The surface only ever carries references (hashes, URLs, peer ids); key
//! material and raw weights never pass through it.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tower_http::limit::RequestBodyLimitLayer;

use fedmesh_store::{ObjectStore, DEFAULT_PRESIGN_TTL};

use crate::{
    command::{Command, CommandEnvelope, CommandRequest},
    error::NodeError,
};

/// A queued command must complete within this budget; `train` does ledger
/// and presign round-trips, so this is generous.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct HttpState {
    cmd_tx: mpsc::Sender<CommandEnvelope>,
    /// Serializes `/command` handling.
    gate: Arc<Mutex<()>>,
    store: Option<Arc<ObjectStore>>,
}

impl HttpState {
    pub fn new(cmd_tx: mpsc::Sender<CommandEnvelope>, store: Option<Arc<ObjectStore>>) -> Self {
        Self {
            cmd_tx,
            gate: Arc::new(Mutex::new(())),
            store,
        }
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/command", post(command))
        .route("/generate-presigned-url", post(generate_presigned_url))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(port: u16, state: HttpState) -> Result<(), NodeError> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| NodeError::Internal(format!("http bind :{port}: {e}")))?;
    tracing::info!("control surface listening on :{port}");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| NodeError::Internal(format!("http server: {e}")))
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn status() -> impl IntoResponse {
    Json(json!({ "status": "running" }))
}

async fn command(
    State(state): State<HttpState>,
    Json(req): Json<CommandRequest>,
) -> impl IntoResponse {
    let command = match Command::parse(&req) {
        Ok(c) => c,
        Err(e) => return error_response(&e),
    };
    tracing::debug!(cmd = %req.cmd, "command received");

    // One outstanding command at a time.
    let _serial = state.gate.lock().await;

    let (reply_tx, reply_rx) = oneshot::channel();
    let envelope = CommandEnvelope { command, reply: reply_tx };
    if state.cmd_tx.send(envelope).await.is_err() {
        return error_response(&NodeError::Internal("node is shutting down".into()));
    }

    match tokio::time::timeout(COMMAND_TIMEOUT, reply_rx).await {
        Ok(Ok(Ok(result))) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "result": result })),
        ),
        Ok(Ok(Err(e))) => error_response(&e),
        Ok(Err(_)) => error_response(&NodeError::Internal("command dropped".into())),
        Err(_) => error_response(&NodeError::Internal("command timed out".into())),
    }
}

#[derive(Debug, Deserialize)]
struct PresignRequest {
    hash: String,
}

async fn generate_presigned_url(
    State(state): State<HttpState>,
    Json(req): Json<PresignRequest>,
) -> impl IntoResponse {
    let Some(store) = &state.store else {
        return error_response(&NodeError::Internal("no object store configured".into()));
    };

    let hash = req.hash.trim().to_string();
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return error_response(&NodeError::BadArgs("hash must be 64 hex characters".into()));
    }

    let url = match store.presign_get(&hash, DEFAULT_PRESIGN_TTL).await {
        Ok(url) => url,
        Err(e) => {
            // Degrade to the raw bucket URL; the UI observes the
            // authorization error and retries through this endpoint.
            tracing::warn!("presign {hash} failed ({e}); returning raw URL");
            store.raw_url(&hash)
        }
    };

    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "presignedUrl": url, "hash": hash })),
    )
}

fn error_response(e: &NodeError) -> (StatusCode, Json<Value>) {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({ "status": "error", "error": e.to_string() })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    /// Drains queued envelopes like a trivial role loop would.
    fn spawn_echo_role(mut rx: mpsc::Receiver<CommandEnvelope>) {
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                let result = match env.command {
                    Command::Status => Ok(json!({ "role": "test" })),
                    Command::Mesh => Ok(json!([])),
                    _ => Err(NodeError::UnknownCommand("not in test role".into())),
                };
                let _ = env.reply.send(result);
            }
        });
    }

    async fn serve_router() -> (String, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(8);
        spawn_echo_role(rx);
        let app = router(HttpState::new(tx, None));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let jh = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), jh)
    }

    #[tokio::test]
    async fn status_reports_running() {
        let (base, _jh) = serve_router().await;
        let body: Value = reqwest::get(format!("{base}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "running");
    }

    #[tokio::test]
    async fn commands_round_trip_through_the_role_loop() {
        let (base, _jh) = serve_router().await;
        let client = reqwest::Client::new();
        let body: Value = client
            .post(format!("{base}/command"))
            .json(&json!({ "cmd": "status", "args": [] }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["result"]["role"], "test");
    }

    #[tokio::test]
    async fn unknown_commands_are_400() {
        let (base, _jh) = serve_router().await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/command"))
            .json(&json!({ "cmd": "reboot", "args": [] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn presign_without_a_store_is_an_internal_error() {
        let (base, _jh) = serve_router().await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/generate-presigned-url"))
            .json(&json!({ "hash": "ab".repeat(32) }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 500);
    }
}
