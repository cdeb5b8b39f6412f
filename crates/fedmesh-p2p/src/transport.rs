//! Transport construction and keypair management.

use std::{fs, path::Path, time::Duration};

use libp2p::{
    core::{muxing::StreamMuxerBox, upgrade},
    identity, noise,
    swarm::Config as SwarmConfig,
    tcp, yamux, PeerId, Transport,
};

use crate::error::OverlayError;

/// How many heartbeat intervals an idle connection is kept alive.
///
/// The bootstrap link goes quiet between rounds; six heartbeats covers the
/// redial backoff cap and the stretch between an assignment going out and
/// the first on-chain submission coming back, so the star topology never
/// flaps while a round is merely waiting.
const IDLE_HEARTBEATS: u32 = 6;

/// The wire stack every fedmesh role shares: plain TCP with Nagle off (the
/// round protocol is small control messages, never bulk data — that moves
/// through signed URLs), Noise authenticating the `PeerId`, Yamux
/// multiplexing.  Nothing fedmesh-specific lives below gossipsub.
pub fn build_transport(
    key: &identity::Keypair,
) -> Result<libp2p::core::transport::Boxed<(PeerId, StreamMuxerBox)>, OverlayError> {
    let auth = noise::Config::new(key)
        .map_err(|e| OverlayError::Transport(format!("noise config: {e}")))?;
    Ok(tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
        .upgrade(upgrade::Version::V1)
        .authenticate(auth)
        .multiplex(yamux::Config::default())
        .boxed())
}

/// Swarm configuration scaled to the overlay's heartbeat: the idle timeout
/// is [`IDLE_HEARTBEATS`] announce/eviction windows rather than a fixed
/// number, so shortening the heartbeat (as the tests do) shortens it too.
pub fn swarm_config(heartbeat: Duration) -> SwarmConfig {
    SwarmConfig::with_tokio_executor().with_idle_connection_timeout(heartbeat * IDLE_HEARTBEATS)
}

/// Load a persisted `identity::Keypair` from `path`, or generate a new one and
/// write it to `path` in protobuf encoding.
///
/// Keys are stored as protobuf-encoded `Keypair` (libp2p standard).  A file
/// that fails to decode is a hard error: silently rotating the identity would
/// change the PeerId under the bootstrap directory and every chunk assignment
/// that names this peer, so the operator must delete the file explicitly.
pub fn load_or_create_keypair(path: &Path) -> Result<identity::Keypair, OverlayError> {
    if path.exists() {
        let raw = fs::read(path).map_err(|e| OverlayError::Keypair(e.to_string()))?;
        return identity::Keypair::from_protobuf_encoding(&raw).map_err(|_| {
            OverlayError::Keypair(format!(
                "keypair file '{}' ({} bytes) could not be decoded. Delete the file to \
                 generate a fresh identity, then restart the node.",
                path.display(),
                raw.len()
            ))
        });
    }

    let key = identity::Keypair::generate_ed25519();
    let raw = key
        .to_protobuf_encoding()
        .map_err(|e| OverlayError::Keypair(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| OverlayError::Keypair(e.to_string()))?;
    }
    fs::write(path, &raw).map_err(|e| OverlayError::Keypair(e.to_string()))?;
    tracing::info!("Generated new keypair at {}", path.display());
    Ok(key)
}
