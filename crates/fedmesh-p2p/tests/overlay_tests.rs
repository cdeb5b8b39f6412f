//! Loopback overlay tests.
//!
//! All tests run on real TCP with port 0 and a bootstrap node in the same
//! process.  No external services are needed.

use std::time::Duration;

use libp2p::Multiaddr;
use tokio::time::timeout;

use fedmesh_p2p::{
    node::{OverlayConfig, OverlayEvent, OverlayHandle, OverlayNode},
    protocol::types::{NodeRole, RoundMessage},
    transport::load_or_create_keypair,
};

// ── Helpers ───────────────────────────────────────────────────────────────────

fn node_config(role: NodeRole, bootstrap: Option<Multiaddr>) -> OverlayConfig {
    let mut cfg = OverlayConfig::new(role);
    cfg.bootstrap_addr = bootstrap;
    cfg.relay_all_topics = role == NodeRole::Bootstrap;
    cfg.heartbeat = Duration::from_secs(2);
    cfg
}

async fn spawn_node(cfg: OverlayConfig) -> OverlayHandle {
    let node = OverlayNode::new(cfg).unwrap();
    let handle = node.handle();
    tokio::spawn(async move {
        if let Err(e) = node.run().await {
            eprintln!("overlay node exited: {e}");
        }
    });
    handle
}

/// Poll `check` every 100 ms until it returns true or the budget elapses.
async fn wait_until<F: Fn() -> bool>(check: F, label: &str) {
    timeout(Duration::from_secs(20), async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timeout waiting for: {label}"));
}

/// First loopback listen address of a node, with its `/p2p/` suffix.
async fn loopback_addr(handle: &OverlayHandle) -> Multiaddr {
    let mut addr = None;
    timeout(Duration::from_secs(10), async {
        loop {
            let addrs = handle.local_addrs().await.unwrap();
            if let Some(a) = addrs.iter().find(|a| a.contains("127.0.0.1")) {
                addr = Some(a.parse().unwrap());
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("node never bound a loopback listener");
    addr.unwrap()
}

// ── Keypair persistence ───────────────────────────────────────────────────────

#[test]
fn keypair_persists_across_loads() {
    use libp2p::PeerId;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("key");

    let key1 = load_or_create_keypair(&path).unwrap();
    let key2 = load_or_create_keypair(&path).unwrap();

    assert_eq!(
        PeerId::from(key1.public()),
        PeerId::from(key2.public()),
        "loaded keypair must produce the same PeerId as the generated one"
    );
}

#[test]
fn corrupt_keypair_file_is_a_hard_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("key");
    std::fs::write(&path, b"not a protobuf keypair").unwrap();

    let err = load_or_create_keypair(&path).unwrap_err();
    assert!(err.to_string().contains("could not be decoded"));
    // The corrupt file must survive so the operator can inspect it.
    assert!(path.exists());
}

// ── Directory propagation & message flow ──────────────────────────────────────

/// The full rendezvous path: a trainer and a client connect only to the
/// bootstrap, the client still sees the trainer in the round-topic mesh (via
/// role announcements relayed over the discovery topic), and a message
/// published by the client reaches the trainer through the bootstrap.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn star_topology_mesh_and_message_flow() {
    let boot = spawn_node(node_config(NodeRole::Bootstrap, None)).await;
    let boot_addr = loopback_addr(&boot).await;

    let trainer = spawn_node(node_config(NodeRole::Trainer, Some(boot_addr.clone()))).await;
    let client = spawn_node(node_config(NodeRole::Client, Some(boot_addr))).await;

    let trainer_id = trainer.local_peer_id();
    let mut trainer_events = trainer.subscribe_events();

    trainer.subscribe("7").await.unwrap();
    client.subscribe("7").await.unwrap();

    // Bootstrap sees the trainer in topic 7 directly (gossipsub subscription).
    wait_until(
        || boot.mesh("7").iter().any(|r| r.peer_id == trainer_id),
        "bootstrap mesh contains trainer",
    )
    .await;

    // The client learns the trainer's role and membership via announcements
    // relayed through the bootstrap — this is the trainer-assembly path.
    wait_until(
        || {
            client
                .mesh("7")
                .iter()
                .any(|r| r.peer_id == trainer_id && r.role == NodeRole::Trainer)
        },
        "client mesh contains announced trainer",
    )
    .await;

    // Publish until the trainer observes the message; the first publishes can
    // race mesh formation and that is fine — round messages are idempotent.
    let received = timeout(Duration::from_secs(20), async {
        loop {
            let _ = client
                .publish("7", RoundMessage::Advertise { task_id: 7 })
                .await;
            let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
            while let Ok(Ok(ev)) = timeout_at_recv(&mut trainer_events, deadline).await {
                if let OverlayEvent::Message {
                    topic,
                    message: RoundMessage::Advertise { task_id },
                    ..
                } = ev
                {
                    if topic == "7" && task_id == 7 {
                        return;
                    }
                }
            }
        }
    })
    .await;
    assert!(received.is_ok(), "trainer never received the advertisement");
}

async fn timeout_at_recv(
    rx: &mut tokio::sync::broadcast::Receiver<OverlayEvent>,
    deadline: tokio::time::Instant,
) -> Result<Result<OverlayEvent, tokio::sync::broadcast::error::RecvError>, tokio::time::error::Elapsed>
{
    tokio::time::timeout_at(deadline, rx.recv()).await
}

/// Leaving a topic is reflected in the bootstrap's directory.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unsubscribe_clears_mesh_membership() {
    let boot = spawn_node(node_config(NodeRole::Bootstrap, None)).await;
    let boot_addr = loopback_addr(&boot).await;

    let trainer = spawn_node(node_config(NodeRole::Trainer, Some(boot_addr))).await;
    let trainer_id = trainer.local_peer_id();

    trainer.subscribe("42").await.unwrap();
    wait_until(
        || boot.mesh("42").iter().any(|r| r.peer_id == trainer_id),
        "trainer joined topic 42",
    )
    .await;

    trainer.unsubscribe("42").await.unwrap();
    wait_until(
        || !boot.mesh("42").iter().any(|r| r.peer_id == trainer_id),
        "trainer left topic 42",
    )
    .await;

    // Still connected and announced on the discovery topic.
    wait_until(
        || boot.directory().iter().any(|r| r.peer_id == trainer_id),
        "trainer still in directory",
    )
    .await;
}
