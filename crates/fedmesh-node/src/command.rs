// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The `/command` wire table.
//!
//! The UI speaks `{cmd, args}` with loosely-typed string arguments; this
//! module turns that into the exhaustive [`Command`] enum the role state
//! machines match on.  Unknown commands and malformed arguments are rejected
//! here, before anything reaches a state machine.

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;

use fedmesh_p2p::Multiaddr;

use crate::error::NodeError;

/// Raw `/command` request body.
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// A parsed control command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect { addr: Multiaddr },
    Advertise { task_id: u64 },
    Train {
        task_id: u64,
        model_hash: String,
        manifest_url: String,
        session_pub_key: String,
    },
    Join { topic: String },
    Leave { topic: String },
    Publish { topic: String, message: String },
    Mesh,
    BootMesh,
    Peers,
    Local,
    Topics,
    Status,
}

/// A command paired with its reply channel, as queued to a role loop.
#[derive(Debug)]
pub struct CommandEnvelope {
    pub command: Command,
    pub reply: oneshot::Sender<Result<Value, NodeError>>,
}

impl Command {
    pub fn parse(req: &CommandRequest) -> Result<Self, NodeError> {
        let args = &req.args;
        match req.cmd.as_str() {
            "connect" => {
                let addr: Multiaddr = str_arg(args, 0, "multiaddr")?
                    .parse()
                    .map_err(|e| NodeError::BadArgs(format!("multiaddr: {e}")))?;
                Ok(Command::Connect { addr })
            }
            // Historical spelling kept for the UI; both forms are accepted.
            "advertize" | "advertise" => Ok(Command::Advertise {
                task_id: u64_arg(args, 0, "taskId")?,
            }),
            "train" => parse_train(args),
            "join" => Ok(Command::Join { topic: str_arg(args, 0, "topic")? }),
            "leave" => Ok(Command::Leave { topic: str_arg(args, 0, "topic")? }),
            "publish" => Ok(Command::Publish {
                topic: str_arg(args, 0, "topic")?,
                message: str_arg(args, 1, "message")?,
            }),
            "mesh" => Ok(Command::Mesh),
            "bootmesh" => Ok(Command::BootMesh),
            "peers" => Ok(Command::Peers),
            "local" => Ok(Command::Local),
            "topics" => Ok(Command::Topics),
            "status" => Ok(Command::Status),
            other => Err(NodeError::UnknownCommand(other.to_string())),
        }
    }
}

/// `train` takes `[taskId, "<modelHash> <manifestURL> <pubKey>"]` (the UI
/// form) or the four arguments spelled out.
fn parse_train(args: &[Value]) -> Result<Command, NodeError> {
    let task_id = u64_arg(args, 0, "taskId")?;
    let (model_hash, manifest_url, session_pub_key) = if args.len() == 2 {
        let packed = str_arg(args, 1, "train parameters")?;
        let parts: Vec<&str> = packed.split_whitespace().collect();
        let [model, manifest, key] = parts.as_slice() else {
            return Err(NodeError::BadArgs(
                "train expects \"<modelHash> <manifestURL> <pubKey>\"".into(),
            ));
        };
        (model.to_string(), manifest.to_string(), key.to_string())
    } else {
        (
            str_arg(args, 1, "modelHash")?,
            str_arg(args, 2, "manifestURL")?,
            str_arg(args, 3, "pubKey")?,
        )
    };

    if model_hash.len() != 64 || !model_hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(NodeError::BadArgs(format!(
            "modelHash must be 64 hex characters, got {model_hash:?}"
        )));
    }

    Ok(Command::Train {
        task_id,
        model_hash,
        manifest_url,
        session_pub_key,
    })
}

fn str_arg(args: &[Value], index: usize, what: &str) -> Result<String, NodeError> {
    match args.get(index) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(other) => Err(NodeError::BadArgs(format!("{what}: expected string, got {other}"))),
        None => Err(NodeError::BadArgs(format!("missing argument {index}: {what}"))),
    }
}

/// Accept both JSON numbers and numeric strings — UIs send either.
fn u64_arg(args: &[Value], index: usize, what: &str) -> Result<u64, NodeError> {
    match args.get(index) {
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| NodeError::BadArgs(format!("{what}: not an unsigned integer"))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|e| NodeError::BadArgs(format!("{what}: {e}"))),
        Some(other) => Err(NodeError::BadArgs(format!("{what}: expected number, got {other}"))),
        None => Err(NodeError::BadArgs(format!("missing argument {index}: {what}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req(cmd: &str, args: Vec<Value>) -> CommandRequest {
        CommandRequest { cmd: cmd.into(), args }
    }

    #[test]
    fn both_advertize_spellings_parse() {
        for spelling in ["advertize", "advertise"] {
            let cmd = Command::parse(&req(spelling, vec![json!(3)])).unwrap();
            assert_eq!(cmd, Command::Advertise { task_id: 3 });
        }
    }

    #[test]
    fn task_id_accepts_string_form() {
        let cmd = Command::parse(&req("advertize", vec![json!("12")])).unwrap();
        assert_eq!(cmd, Command::Advertise { task_id: 12 });
    }

    #[test]
    fn train_parses_the_packed_ui_form() {
        let hash = "ab".repeat(32);
        let cmd = Command::parse(&req(
            "train",
            vec![json!(1), json!(format!("{hash} https://store/m?sig=x 04beef"))],
        ))
        .unwrap();
        assert_eq!(
            cmd,
            Command::Train {
                task_id: 1,
                model_hash: hash,
                manifest_url: "https://store/m?sig=x".into(),
                session_pub_key: "04beef".into(),
            }
        );
    }

    #[test]
    fn train_rejects_short_model_hash() {
        let err = Command::parse(&req("train", vec![json!(1), json!("abcd https://m 04")]))
            .unwrap_err();
        assert!(matches!(err, NodeError::BadArgs(_)));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = Command::parse(&req("reboot", vec![])).unwrap_err();
        assert!(matches!(err, NodeError::UnknownCommand(_)));
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn missing_arguments_are_reported_by_name() {
        let err = Command::parse(&req("join", vec![])).unwrap_err();
        assert!(err.to_string().contains("topic"));
    }

    #[test]
    fn connect_requires_a_valid_multiaddr() {
        assert!(Command::parse(&req("connect", vec![json!("/ip4/10.0.0.1/tcp/4001")])).is_ok());
        assert!(Command::parse(&req("connect", vec![json!("10.0.0.1:4001")])).is_err());
    }
}
