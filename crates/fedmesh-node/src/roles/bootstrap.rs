// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Bootstrap role: the rendezvous point.
//!
//! A single `Serving` state.  The overlay task maintains the peer directory
//! (connects, role announcements, topic joins, disconnects); this loop only
//! answers admin queries from that snapshot and logs membership churn.

use serde_json::json;
use tokio::sync::mpsc;

use fedmesh_p2p::{OverlayEvent, OverlayHandle};

use crate::{
    command::{Command, CommandEnvelope},
    error::NodeError,
    roles::{directory_json, shared_command, shutdown_signal},
};

pub struct BootstrapNode {
    overlay: OverlayHandle,
    http: reqwest::Client,
}

impl BootstrapNode {
    pub fn new(overlay: OverlayHandle, http: reqwest::Client) -> Self {
        Self { overlay, http }
    }

    pub async fn run(self, mut cmd_rx: mpsc::Receiver<CommandEnvelope>) -> Result<(), NodeError> {
        let mut events = self.overlay.subscribe_events();
        tracing::info!("bootstrap serving; peer_id={}", self.overlay.local_peer_id());

        loop {
            tokio::select! {
                Some(env) = cmd_rx.recv() => {
                    let result = self.handle_command(&env.command).await;
                    let _ = env.reply.send(result);
                }
                event = events.recv() => match event {
                    Ok(OverlayEvent::PeerJoined { topic, peer }) => {
                        tracing::info!("peer {peer} joined {topic}");
                    }
                    Ok(OverlayEvent::PeerLeft { topic, peer }) => {
                        tracing::info!("peer {peer} left {topic}");
                    }
                    Ok(OverlayEvent::Disconnected { peer }) => {
                        tracing::info!("peer {peer} disconnected");
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("overlay event stream lagged by {n}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown_signal() => {
                    tracing::info!("shutting down");
                    self.overlay.shutdown().await;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_command(&self, cmd: &Command) -> Result<serde_json::Value, NodeError> {
        // The bootstrap answers bootmesh locally: it *is* the bootstrap.
        if let Some(result) = shared_command(&self.overlay, &self.http, None, cmd).await {
            return result;
        }
        match cmd {
            Command::Status => Ok(json!({
                "status": "running",
                "role": "bootstrap",
                "peerId": self.overlay.local_peer_id().to_base58(),
                "peers": directory_json(&self.overlay),
            })),
            other => Err(NodeError::UnknownCommand(format!("{other:?} (bootstrap role)"))),
        }
    }
}
