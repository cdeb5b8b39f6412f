// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

use fedmesh_ledger::LedgerError;
use fedmesh_p2p::OverlayError;
use fedmesh_store::StoreError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("bad arguments: {0}")]
    BadArgs(String),

    #[error("no trainers in mesh")]
    NoTrainers,

    #[error("task {0} does not exist on the ledger")]
    TaskMissing(u64),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("training failed: {0}")]
    Training(String),

    #[error("ledger unreachable: {0}")]
    LedgerUnreachable(String),

    #[error("configuration error: {0}")]
    Config(#[from] fedmesh_config::ConfigError),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("internal: {0}")]
    Internal(String),
}

impl NodeError {
    /// HTTP status of the `{status:"error"}` body this error maps to:
    /// malformed input is 400, domain failures are reported with 200 so the
    /// UI can read the precise failing step, everything else is 500.
    pub fn http_status(&self) -> u16 {
        match self {
            NodeError::UnknownCommand(_) | NodeError::BadArgs(_) => 400,
            NodeError::NoTrainers
            | NodeError::TaskMissing(_)
            | NodeError::Invariant(_)
            | NodeError::Training(_)
            | NodeError::Ledger(_)
            | NodeError::Storage(_)
            | NodeError::Overlay(_) => 200,
            _ => 500,
        }
    }

    /// Process exit code per the operational contract: 1 startup/config,
    /// 2 bootstrap unreachable, 3 ledger unreachable.
    pub fn exit_code(&self) -> u8 {
        match self {
            NodeError::Overlay(OverlayError::BootstrapUnreachable(_)) => 2,
            NodeError::LedgerUnreachable(_) => 3,
            _ => 1,
        }
    }
}
