// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Node startup — assembles the subsystems for each role and runs them.
//!
//! Startup order (client/trainer):
//!
//! 1. Validate the role's required config sections (exit 1 on failure).
//! 2. Construct the ledger client and probe the mirror (exit 3 on failure).
//! 3. Start the overlay and wait for the bootstrap link (exit 2 on failure).
//! 4. Start the HTTP control surface and the command forwarder.
//! 5. Run the role event loop until shutdown.
//!
//! A bootstrap node skips 2–3: it holds no training state and needs neither
//! ledger nor object store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use fedmesh_config::Config;
use fedmesh_ledger::LedgerClient;
use fedmesh_p2p::{
    Multiaddr, NodeRole, OverlayConfig, OverlayError, OverlayEvent, OverlayHandle, OverlayNode,
    Protocol,
};
use fedmesh_store::ObjectStore;

use crate::{
    command::CommandEnvelope,
    error::NodeError,
    http::{self, HttpState},
    roles::{
        bootstrap::BootstrapNode,
        client::{ClientEvent, ClientNode},
        trainer::{TrainerEvent, TrainerNode},
    },
};

const BOOTSTRAP_HTTP_PORT: u16 = 9000;
const NODE_HTTP_PORT: u16 = 9001;

/// Admin port assumed for the bootstrap's control surface when relaying
/// `bootmesh` queries.
const BOOTSTRAP_ADMIN_PORT: u16 = 9000;

pub async fn run_bootstrap(config: Config) -> Result<(), NodeError> {
    let overlay_config = overlay_config(NodeRole::Bootstrap, &config, None)?;
    let node = OverlayNode::new(overlay_config)?;
    let overlay = node.handle();
    tokio::spawn(async move {
        if let Err(e) = node.run().await {
            tracing::error!("overlay stopped: {e}");
        }
    });

    let (http_tx, cmd_rx) = mpsc::channel::<CommandEnvelope>(16);
    let port = config.http_port.unwrap_or(BOOTSTRAP_HTTP_PORT);
    tokio::spawn(http::serve(port, HttpState::new(http_tx, None)));

    BootstrapNode::new(overlay, reqwest::Client::new()).run(cmd_rx).await
}

pub async fn run_client(config: Config) -> Result<(), NodeError> {
    let ledger = Arc::new(LedgerClient::new(config.require_ledger()?)?);
    ledger
        .ping()
        .await
        .map_err(|e| NodeError::LedgerUnreachable(e.to_string()))?;
    let store = Arc::new(ObjectStore::new(config.require_store()?));

    let overlay_config =
        overlay_config(NodeRole::Client, &config, Some(ledger.account_address()))?;
    let overlay = start_overlay(overlay_config).await?;

    let (client, event_rx) = ClientNode::new(
        overlay,
        ledger,
        Arc::clone(&store),
        bootstrap_admin_url(&config),
    );

    let (http_tx, mut http_rx) = mpsc::channel::<CommandEnvelope>(16);
    let port = config.http_port.unwrap_or(NODE_HTTP_PORT);
    tokio::spawn(http::serve(port, HttpState::new(http_tx, Some(store))));

    let event_tx = client.event_sender();
    tokio::spawn(async move {
        while let Some(env) = http_rx.recv().await {
            if event_tx.send(ClientEvent::Command(env)).await.is_err() {
                break;
            }
        }
    });

    client.run(event_rx).await
}

pub async fn run_trainer(config: Config) -> Result<(), NodeError> {
    let ledger = Arc::new(LedgerClient::new(config.require_ledger()?)?);
    ledger
        .ping()
        .await
        .map_err(|e| NodeError::LedgerUnreachable(e.to_string()))?;
    let store = Arc::new(ObjectStore::new(config.require_store()?));

    let overlay_config =
        overlay_config(NodeRole::Trainer, &config, Some(ledger.account_address()))?;
    let overlay = start_overlay(overlay_config).await?;

    let (trainer, event_rx) = TrainerNode::new(
        overlay,
        ledger,
        Arc::clone(&store),
        bootstrap_admin_url(&config),
    )?;

    let (http_tx, mut http_rx) = mpsc::channel::<CommandEnvelope>(16);
    let port = config.http_port.unwrap_or(NODE_HTTP_PORT);
    tokio::spawn(http::serve(port, HttpState::new(http_tx, Some(store))));

    let event_tx = trainer.event_sender();
    tokio::spawn(async move {
        while let Some(env) = http_rx.recv().await {
            if event_tx.send(TrainerEvent::Command(env)).await.is_err() {
                break;
            }
        }
    });

    trainer.run(event_rx).await
}

// ── Assembly helpers ──────────────────────────────────────────────────────────

fn overlay_config(
    role: NodeRole,
    config: &Config,
    account: Option<String>,
) -> Result<OverlayConfig, NodeError> {
    let mut oc = OverlayConfig::new(role);
    oc.keypair_path = Some(config.keypair_path(&role.to_string()));
    oc.account = account;

    if role == NodeRole::Bootstrap {
        oc.listen_port = config.p2p_port;
        oc.relay_all_topics = true;
    } else {
        let addr: Multiaddr = config
            .require_bootstrap_addr()?
            .parse()
            .map_err(|e| NodeError::Internal(format!("BOOTSTRAP_ADDR: {e}")))?;
        oc.bootstrap_addr = Some(addr);
    }

    if config.is_cloud {
        oc.external_ip = config.node_ip;
    }
    Ok(oc)
}

/// Spawn the overlay and wait until the bootstrap link is up.  The overlay
/// itself bounds the dial attempts, so a dead rendezvous point surfaces here
/// as `BootstrapUnreachable` (exit code 2).
async fn start_overlay(config: OverlayConfig) -> Result<OverlayHandle, NodeError> {
    let node = OverlayNode::new(config)?;
    let handle = node.handle();
    let mut events = handle.subscribe_events();
    let mut running = tokio::spawn(node.run());

    loop {
        tokio::select! {
            result = &mut running => {
                return Err(match result {
                    Ok(Ok(())) => NodeError::Overlay(OverlayError::Shutdown),
                    Ok(Err(e)) => NodeError::Overlay(e),
                    Err(e) => NodeError::Internal(format!("overlay task: {e}")),
                });
            }
            event = events.recv() => match event {
                Ok(OverlayEvent::Connected { peer }) => {
                    tracing::info!("bootstrap link established via {peer}");
                    // Keep the overlay running for the node's lifetime.
                    tokio::spawn(async move {
                        match running.await {
                            Ok(Ok(())) => tracing::info!("overlay stopped"),
                            Ok(Err(e)) => tracing::error!("overlay stopped: {e}"),
                            Err(e) => tracing::error!("overlay task: {e}"),
                        }
                    });
                    return Ok(handle);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    // The run task is about to resolve; yield until it does.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
        }
    }
}

/// Admin endpoint of the bootstrap node, derived from `BOOTSTRAP_ADDR`.
fn bootstrap_admin_url(config: &Config) -> Option<String> {
    let addr: Multiaddr = config.bootstrap_addr.as_deref()?.parse().ok()?;
    addr.iter().find_map(|p| match p {
        Protocol::Ip4(ip) => Some(format!("http://{ip}:{BOOTSTRAP_ADMIN_PORT}")),
        Protocol::Dns4(host) | Protocol::Dns(host) => {
            Some(format!("http://{host}:{BOOTSTRAP_ADMIN_PORT}"))
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn bootstrap_admin_url_comes_from_the_multiaddr() {
        let mut vars = HashMap::new();
        vars.insert(
            "BOOTSTRAP_ADDR".to_string(),
            "/ip4/10.1.2.3/tcp/4001".to_string(),
        );
        let config = fedmesh_config::from_vars(&vars).unwrap();
        assert_eq!(
            bootstrap_admin_url(&config).as_deref(),
            Some("http://10.1.2.3:9000")
        );
    }

    #[test]
    fn missing_bootstrap_addr_means_no_admin_relay() {
        let config = fedmesh_config::from_vars(&HashMap::new()).unwrap();
        assert_eq!(bootstrap_admin_url(&config), None);
    }
}
