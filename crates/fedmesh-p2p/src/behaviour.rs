//! libp2p `NetworkBehaviour` composition shared by all node roles.

use std::time::Duration;

use libp2p::{
    gossipsub::{self, MessageAuthenticity, ValidationMode},
    identify, identity, ping,
    swarm::NetworkBehaviour,
};

use crate::error::OverlayError;

const APP_PROTO: &str = "/fedmesh/1.0.0";

/// Combined behaviour for a fedmesh node.
///
/// - `gossipsub` — topic pubsub carrying the round protocol; messages are
///   signed so `Message::source` is the authenticated originator
/// - `identify`  — address exchange so peers learn each other's multiaddrs
/// - `ping`      — keeps the bootstrap link alive between rounds
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "OverlayBehaviourEvent")]
pub struct OverlayBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
}

/// Unified event type produced by `OverlayBehaviour`.
#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum OverlayBehaviourEvent {
    Gossipsub(gossipsub::Event),
    Identify(identify::Event),
    Ping(ping::Event),
}

impl From<gossipsub::Event> for OverlayBehaviourEvent {
    fn from(e: gossipsub::Event) -> Self {
        OverlayBehaviourEvent::Gossipsub(e)
    }
}
impl From<identify::Event> for OverlayBehaviourEvent {
    fn from(e: identify::Event) -> Self {
        OverlayBehaviourEvent::Identify(e)
    }
}
impl From<ping::Event> for OverlayBehaviourEvent {
    fn from(e: ping::Event) -> Self {
        OverlayBehaviourEvent::Ping(e)
    }
}

impl OverlayBehaviour {
    pub fn new(key: &identity::Keypair) -> Result<Self, OverlayError> {
        let gossip_config = gossipsub::ConfigBuilder::default()
            .validation_mode(ValidationMode::Strict)
            .heartbeat_interval(Duration::from_secs(1))
            .build()
            .map_err(|e| OverlayError::Transport(format!("gossipsub config: {e}")))?;

        let gossipsub =
            gossipsub::Behaviour::new(MessageAuthenticity::Signed(key.clone()), gossip_config)
                .map_err(|e| OverlayError::Transport(format!("gossipsub init: {e}")))?;

        Ok(Self {
            gossipsub,
            identify: identify::Behaviour::new(identify::Config::new(
                APP_PROTO.into(),
                key.public(),
            )),
            ping: ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(15))),
        })
    }
}
