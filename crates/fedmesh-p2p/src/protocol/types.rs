//! Wire-protocol types for the round protocol.
//!
//! All messages travel as a tagged JSON envelope over gossipsub.  Gossipsub
//! signs every message, so the originator is taken from the transport layer
//! (`Message::source`), never from the payload.  Receivers drop payloads with
//! unknown tags at decode time and deduplicate round messages by
//! [`RoundMessage::idempotence_key`].

use serde::{Deserialize, Serialize};

/// The well-known pubsub channel on which roles and task advertisements flow.
/// Every node joins it at startup; per-round topics are named by task id.
pub const DISCOVERY_TOPIC: &str = "fed-learn";

/// Declared role of a peer, one per identity for the node's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Bootstrap,
    Client,
    Trainer,
    /// Connected but not yet announced.
    Unknown,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Bootstrap => write!(f, "bootstrap"),
            NodeRole::Client => write!(f, "client"),
            NodeRole::Trainer => write!(f, "trainer"),
            NodeRole::Unknown => write!(f, "unknown"),
        }
    }
}

/// One entry of the assignment list: dataset chunk index → trainer peer id
/// (base58).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAssignment {
    pub chunk: u32,
    pub trainer: String,
}

/// The round-protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum RoundMessage {
    /// Role + joined-topic announcement; populates the peer directory.
    /// Re-sent periodically so directories converge and evict the silent.
    /// Trainers include their ledger account address so the client can
    /// attribute on-chain weight submissions back to a peer.
    AnnounceRole {
        role: NodeRole,
        topics: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account: Option<String>,
    },

    /// A client opening the round topic for a funded task.
    Advertise { task_id: u64 },

    /// The single source of work for a round.  Published by the client on the
    /// round topic; re-emitted with backoff until every trainer has an
    /// on-chain submission.  Retransmissions carry identical contents.
    Assign {
        task_id: u64,
        model_url: String,
        manifest_url: String,
        session_pub_key: String,
        assignments: Vec<ChunkAssignment>,
    },

    /// Client echo of an on-chain `WeightsSubmitted` observation.
    SubmitAck {
        task_id: u64,
        chunk: u32,
        trainer: String,
        weights_hash: String,
    },

    /// Free-text operator observability; also mirrored to the external log
    /// topic by whoever publishes it.
    Log { text: String },
}

impl RoundMessage {
    /// Deduplication key for at-most-once processing.
    ///
    /// `AnnounceRole` and `Log` return `None`: announcements are refresh
    /// semantics (latest wins) and log lines are display-only.  `Assign`
    /// keys on its full contents, so a retransmission with identical
    /// contents maps to the same key and is a no-op at the receiver.
    pub fn idempotence_key(&self, from: &str) -> Option<String> {
        match self {
            RoundMessage::AnnounceRole { .. } | RoundMessage::Log { .. } => None,
            RoundMessage::Advertise { task_id } => Some(format!("advertise/{task_id}/{from}")),
            RoundMessage::Assign {
                task_id,
                model_url,
                manifest_url,
                session_pub_key,
                assignments,
            } => {
                let mut body = format!("assign/{task_id}/{model_url}/{manifest_url}/{session_pub_key}");
                for a in assignments {
                    body.push_str(&format!("/{}={}", a.chunk, a.trainer));
                }
                Some(body)
            }
            RoundMessage::SubmitAck {
                task_id,
                chunk,
                trainer,
                ..
            } => Some(format!("ack/{task_id}/{chunk}/{trainer}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_assign_retransmission_has_the_same_key() {
        let msg = RoundMessage::Assign {
            task_id: 7,
            model_url: "https://store/model?sig=a".into(),
            manifest_url: "https://store/manifest?sig=b".into(),
            session_pub_key: "04ab".into(),
            assignments: vec![
                ChunkAssignment { chunk: 0, trainer: "12D3KooWAlice".into() },
                ChunkAssignment { chunk: 1, trainer: "12D3KooWBob".into() },
            ],
        };
        assert_eq!(
            msg.idempotence_key("client"),
            msg.clone().idempotence_key("client")
        );

        let mut different = msg.clone();
        if let RoundMessage::Assign { assignments, .. } = &mut different {
            assignments[0].trainer = "12D3KooWCarol".into();
        }
        assert_ne!(msg.idempotence_key("client"), different.idempotence_key("client"));
    }

    #[test]
    fn announce_and_log_are_never_deduplicated() {
        let announce = RoundMessage::AnnounceRole {
            role: NodeRole::Trainer,
            topics: vec![DISCOVERY_TOPIC.into()],
            account: Some(format!("0x{}", "9a".repeat(20))),
        };
        assert!(announce.idempotence_key("x").is_none());
        assert!(RoundMessage::Log { text: "hi".into() }.idempotence_key("x").is_none());
    }

    #[test]
    fn submit_ack_keys_on_task_chunk_and_trainer() {
        let a = RoundMessage::SubmitAck {
            task_id: 1,
            chunk: 2,
            trainer: "t".into(),
            weights_hash: "aa".repeat(32),
        };
        let b = RoundMessage::SubmitAck {
            task_id: 1,
            chunk: 2,
            trainer: "t".into(),
            weights_hash: "bb".repeat(32),
        };
        // First observation wins; a conflicting hash for the same chunk maps
        // to the same key and is dropped by the receiver.
        assert_eq!(a.idempotence_key("c"), b.idempotence_key("c"));
    }
}
