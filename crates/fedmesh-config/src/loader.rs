// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Environment loader.  All `std::env` reads live here.
//!
//! Sections are all-or-nothing: setting any `OBJECT_STORE_*` variable makes
//! the whole store section required, so a half-configured node fails at
//! startup instead of at its first upload.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use tracing::debug;

use crate::schema::{Config, ConfigError, LedgerEnv, StoreEnv};

const LEDGER_VARS: [&str; 6] = [
    "OPERATOR_ID",
    "OPERATOR_KEY",
    "CONTRACT_ID",
    "TOPIC_ID",
    "LEDGER_GATEWAY_URL",
    "LEDGER_MIRROR_URL",
];

const STORE_VARS: [&str; 4] = [
    "OBJECT_STORE_ACCESS_KEY",
    "OBJECT_STORE_SECRET_KEY",
    "OBJECT_STORE_ENDPOINT",
    "OBJECT_STORE_BUCKET",
];

/// Build a [`Config`] from the process environment.
pub fn from_env() -> Result<Config, ConfigError> {
    let vars: HashMap<String, String> = std::env::vars().collect();
    from_vars(&vars)
}

/// Build a [`Config`] from an explicit variable map.  `from_env` is a thin
/// wrapper over this; tests pass maps so they never mutate process state.
pub fn from_vars(vars: &HashMap<String, String>) -> Result<Config, ConfigError> {
    let get = |name: &str| -> Option<String> {
        vars.get(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    };

    let ledger = load_section(&LEDGER_VARS, &get)?.map(|mut v| LedgerEnv {
        operator_id: v.remove("OPERATOR_ID").unwrap_or_default(),
        operator_key: v.remove("OPERATOR_KEY").unwrap_or_default(),
        contract_id: v.remove("CONTRACT_ID").unwrap_or_default(),
        topic_id: v.remove("TOPIC_ID").unwrap_or_default(),
        gateway_url: v.remove("LEDGER_GATEWAY_URL").unwrap_or_default(),
        mirror_url: v.remove("LEDGER_MIRROR_URL").unwrap_or_default(),
    });

    if let Some(ledger) = &ledger {
        validate_operator_key(&ledger.operator_key)?;
    }

    let store = load_section(&STORE_VARS, &get)?.map(|mut v| StoreEnv {
        access_key: v.remove("OBJECT_STORE_ACCESS_KEY").unwrap_or_default(),
        secret_key: v.remove("OBJECT_STORE_SECRET_KEY").unwrap_or_default(),
        endpoint: v.remove("OBJECT_STORE_ENDPOINT").unwrap_or_default(),
        bucket: v.remove("OBJECT_STORE_BUCKET").unwrap_or_default(),
    });

    let node_ip = match get("NODE_IP") {
        None => None,
        Some(raw) => Some(raw.parse::<Ipv4Addr>().map_err(|e| ConfigError::InvalidEnv {
            name: "NODE_IP",
            reason: e.to_string(),
        })?),
    };

    let is_cloud = match get("IS_CLOUD").as_deref() {
        None | Some("0") | Some("false") => false,
        Some("1") | Some("true") => true,
        Some(other) => {
            return Err(ConfigError::InvalidEnv {
                name: "IS_CLOUD",
                reason: format!("expected true/false/1/0, got {other:?}"),
            })
        }
    };

    let p2p_port = parse_port(get("P2P_PORT"), "P2P_PORT")?.unwrap_or(4001);
    let http_port = parse_port(get("HTTP_PORT"), "HTTP_PORT")?;

    let config_dir = get("FEDMESH_CONFIG_DIR").map(PathBuf::from).unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fedmesh")
    });

    debug!(
        ledger = ledger.is_some(),
        store = store.is_some(),
        is_cloud,
        "configuration loaded from environment"
    );

    Ok(Config {
        ledger,
        store,
        bootstrap_addr: get("BOOTSTRAP_ADDR"),
        node_ip,
        is_cloud,
        p2p_port,
        http_port,
        config_dir,
    })
}

/// Returns `Ok(None)` when no variable of the section is set, `Ok(Some(map))`
/// when all are, and an error naming the first missing variable otherwise.
fn load_section(
    names: &[&'static str],
    get: &dyn Fn(&str) -> Option<String>,
) -> Result<Option<HashMap<&'static str, String>>, ConfigError> {
    let mut found = HashMap::new();
    for name in names {
        if let Some(v) = get(name) {
            found.insert(*name, v);
        }
    }
    if found.is_empty() {
        return Ok(None);
    }
    for name in names {
        if !found.contains_key(name) {
            return Err(ConfigError::MissingEnv(name));
        }
    }
    Ok(Some(found))
}

fn validate_operator_key(key: &str) -> Result<(), ConfigError> {
    let bytes = hex::decode(key).map_err(|e| ConfigError::InvalidEnv {
        name: "OPERATOR_KEY",
        reason: e.to_string(),
    })?;
    if bytes.len() != 32 {
        return Err(ConfigError::InvalidEnv {
            name: "OPERATOR_KEY",
            reason: format!("expected 32 bytes of hex, got {}", bytes.len()),
        });
    }
    Ok(())
}

fn parse_port(raw: Option<String>, name: &'static str) -> Result<Option<u16>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u16>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnv { name, reason: e.to_string() }),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("OPERATOR_ID".into(), "0.0.1001".into());
        m.insert("OPERATOR_KEY".into(), "11".repeat(32));
        m.insert("CONTRACT_ID".into(), "0.0.5005".into());
        m.insert("TOPIC_ID".into(), "0.0.7007".into());
        m.insert("LEDGER_GATEWAY_URL".into(), "http://localhost:7546".into());
        m.insert("LEDGER_MIRROR_URL".into(), "http://localhost:5551".into());
        m.insert("OBJECT_STORE_ACCESS_KEY".into(), "minio".into());
        m.insert("OBJECT_STORE_SECRET_KEY".into(), "minio123".into());
        m.insert("OBJECT_STORE_ENDPOINT".into(), "http://localhost:9009".into());
        m.insert("OBJECT_STORE_BUCKET".into(), "fedmesh".into());
        m.insert("BOOTSTRAP_ADDR".into(), "/ip4/127.0.0.1/tcp/4001".into());
        m
    }

    #[test]
    fn full_environment_parses() {
        let c = from_vars(&base_vars()).unwrap();
        assert!(c.ledger.is_some());
        assert!(c.store.is_some());
        assert_eq!(c.p2p_port, 4001);
        assert_eq!(c.http_port, None);
        assert_eq!(c.require_bootstrap_addr().unwrap(), "/ip4/127.0.0.1/tcp/4001");
    }

    #[test]
    fn empty_environment_gives_bootstrap_capable_config() {
        let c = from_vars(&HashMap::new()).unwrap();
        assert!(c.ledger.is_none());
        assert!(c.store.is_none());
        assert!(c.require_ledger().is_err());
        assert!(c.require_store().is_err());
    }

    #[test]
    fn partial_ledger_section_is_rejected() {
        let mut vars = base_vars();
        vars.remove("TOPIC_ID");
        let err = from_vars(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("TOPIC_ID")));
    }

    #[test]
    fn short_operator_key_is_rejected() {
        let mut vars = base_vars();
        vars.insert("OPERATOR_KEY".into(), "abcd".into());
        assert!(matches!(
            from_vars(&vars),
            Err(ConfigError::InvalidEnv { name: "OPERATOR_KEY", .. })
        ));
    }

    #[test]
    fn is_cloud_accepts_both_spellings() {
        for (raw, want) in [("true", true), ("1", true), ("false", false), ("0", false)] {
            let mut vars = base_vars();
            vars.insert("IS_CLOUD".into(), raw.into());
            assert_eq!(from_vars(&vars).unwrap().is_cloud, want, "IS_CLOUD={raw}");
        }
        let mut vars = base_vars();
        vars.insert("IS_CLOUD".into(), "maybe".into());
        assert!(from_vars(&vars).is_err());
    }

    #[test]
    fn keypair_path_is_per_role() {
        let mut vars = base_vars();
        vars.insert("FEDMESH_CONFIG_DIR".into(), "/tmp/fm".into());
        let c = from_vars(&vars).unwrap();
        assert_eq!(c.keypair_path("trainer"), PathBuf::from("/tmp/fm/trainer-keypair"));
    }

    #[test]
    fn operator_key_is_not_serialized() {
        let c = from_vars(&base_vars()).unwrap();
        let json = serde_json::to_string(&c).unwrap();
        assert!(!json.contains(&"11".repeat(32)), "secret key leaked into serialized config");
        assert!(!json.contains("minio123"), "store secret leaked into serialized config");
    }
}
