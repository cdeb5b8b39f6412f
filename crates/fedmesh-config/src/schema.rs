// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Configuration schema for a fedmesh node.
//!
//! A node reads its entire configuration from the environment exactly once at
//! startup (see [`crate::from_env`]) and threads the resulting immutable
//! [`Config`] through every subsystem.  Nothing outside the loader touches
//! `std::env`.
//!
//! The ledger and object-store sections are optional at the schema level
//! because a bootstrap node needs neither; the role startup code calls
//! [`Config::require_ledger`] / [`Config::require_store`] /
//! [`Config::require_bootstrap_addr`] to enforce what its role actually
//! needs, so a client or trainer still fails before any listener starts.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("invalid value for {name}: {reason}")]
    InvalidEnv { name: &'static str, reason: String },
}

/// Ledger signing identity and endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEnv {
    /// Operator account identifier on the ledger.
    pub operator_id: String,
    /// ECDSA secp256k1 private key, 64 hex characters.  Never logged.
    #[serde(skip_serializing)]
    pub operator_key: String,
    /// The training-escrow contract.
    pub contract_id: String,
    /// The append-only consensus topic used for human-readable logs.
    pub topic_id: String,
    /// Transaction submission / view-query endpoint.
    pub gateway_url: String,
    /// Read-only mirror endpoint polled for contract logs.
    pub mirror_url: String,
}

/// S3-style object store credentials and location.
#[derive(Debug, Clone, Serialize)]
pub struct StoreEnv {
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub endpoint: String,
    pub bucket: String,
}

/// The immutable node configuration record.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub ledger: Option<LedgerEnv>,
    pub store: Option<StoreEnv>,

    /// Multiaddr of the bootstrap node, e.g. `/ip4/10.0.0.5/tcp/4001/p2p/12D3…`.
    /// Required for client and trainer roles.
    pub bootstrap_addr: Option<String>,

    /// Public IP advertised to peers when running behind cloud NAT.
    pub node_ip: Option<Ipv4Addr>,
    /// When set, the node listens on all interfaces and advertises `node_ip`.
    pub is_cloud: bool,

    /// Fixed overlay TCP port.  Bootstrap nodes listen here; client and
    /// trainer nodes ignore it and take an OS-assigned port.
    pub p2p_port: u16,

    /// HTTP control-surface port override.  `None` applies the role default
    /// (9000 bootstrap, 9001 client/trainer).
    pub http_port: Option<u16>,

    /// Directory holding the persisted overlay keypair.
    pub config_dir: PathBuf,
}

impl Config {
    pub fn require_ledger(&self) -> Result<&LedgerEnv, ConfigError> {
        self.ledger
            .as_ref()
            .ok_or(ConfigError::MissingEnv("OPERATOR_ID"))
    }

    pub fn require_store(&self) -> Result<&StoreEnv, ConfigError> {
        self.store
            .as_ref()
            .ok_or(ConfigError::MissingEnv("OBJECT_STORE_ACCESS_KEY"))
    }

    pub fn require_bootstrap_addr(&self) -> Result<&str, ConfigError> {
        self.bootstrap_addr
            .as_deref()
            .ok_or(ConfigError::MissingEnv("BOOTSTRAP_ADDR"))
    }

    /// Path where the overlay keypair for `role` is persisted across runs.
    pub fn keypair_path(&self, role: &str) -> PathBuf {
        self.config_dir.join(format!("{role}-keypair"))
    }
}
