pub mod behaviour;
pub mod error;
pub mod node;
pub mod protocol;
pub mod transport;

pub use error::OverlayError;
pub use node::{OverlayConfig, OverlayEvent, OverlayHandle, OverlayNode, PeerRecord};
pub use protocol::types::{
    ChunkAssignment, NodeRole, RoundMessage, DISCOVERY_TOPIC,
};

pub use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
