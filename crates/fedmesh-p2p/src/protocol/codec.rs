//! JSON codec for the round-protocol envelope.
//!
//! Gossipsub payloads are opaque bytes; this module is the single place that
//! turns them into [`RoundMessage`]s and back.  A payload whose tag is
//! unknown (or whose JSON is malformed) decodes to an error and is dropped
//! by the overlay with a debug log, per the protocol's forward-compatibility
//! rule.

use crate::{error::OverlayError, protocol::types::RoundMessage};

pub fn encode(msg: &RoundMessage) -> Result<Vec<u8>, OverlayError> {
    serde_json::to_vec(msg).map_err(|e| OverlayError::Codec(e.to_string()))
}

pub fn decode(data: &[u8]) -> Result<RoundMessage, OverlayError> {
    serde_json::from_slice(data).map_err(|e| OverlayError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{ChunkAssignment, NodeRole, RoundMessage};

    #[test]
    fn envelope_round_trips() {
        let msg = RoundMessage::Assign {
            task_id: 42,
            model_url: "https://store/m?sig=x".into(),
            manifest_url: "https://store/d?sig=y".into(),
            session_pub_key: "04beef".into(),
            assignments: vec![ChunkAssignment { chunk: 0, trainer: "12D3KooWPeer".into() }],
        };
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn tag_is_on_the_wire() {
        let bytes = encode(&RoundMessage::Advertise { task_id: 9 }).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["tag"], "advertise");
        assert_eq!(v["task_id"], 9);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = decode(br#"{"tag":"reassign","task_id":1}"#).unwrap_err();
        assert!(matches!(err, OverlayError::Codec(_)));
    }

    #[test]
    fn role_announcement_uses_lowercase_roles() {
        let bytes = encode(&RoundMessage::AnnounceRole {
            role: NodeRole::Trainer,
            topics: vec!["fed-learn".into(), "3".into()],
            account: None,
        })
        .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["role"], "trainer");
        // Absent account is omitted, and older announcements without the
        // field still decode.
        assert!(v.get("account").is_none());
        assert!(decode(&bytes).is_ok());
    }
}
