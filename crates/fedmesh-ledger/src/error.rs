// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Transport-level failure (connection refused, timeout, 5xx).  Retried
    /// with backoff by the caller.
    #[error("ledger rpc error: {0}")]
    Rpc(String),

    /// The gateway reported a structured failure status.  `CONTRACT_REVERT`
    /// and `INVALID_SIGNATURE` are terminal — replaying the identical call
    /// rejects identically; every other status (`PAYER_ACCOUNT_NOT_FOUND`,
    /// busy/backpressure codes, …) is a submission failure that may clear
    /// on retry.
    #[error("ledger: {status}: {message}")]
    Gateway { status: String, message: String },

    #[error("ledger response decode error: {0}")]
    Decode(String),

    #[error("operator key error: {0}")]
    InvalidKey(String),

    #[error("signing error: {0}")]
    Signer(String),
}

impl LedgerError {
    /// Transport failures and non-terminal gateway statuses are retried;
    /// only a contract revert or a signature rejection aborts immediately.
    pub fn is_retriable(&self) -> bool {
        match self {
            LedgerError::Rpc(_) => true,
            LedgerError::Gateway { status, .. } => {
                !matches!(status.as_str(), "CONTRACT_REVERT" | "INVALID_SIGNATURE")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(status: &str) -> LedgerError {
        LedgerError::Gateway {
            status: status.into(),
            message: String::new(),
        }
    }

    #[test]
    fn only_revert_and_bad_signature_are_terminal() {
        assert!(!gateway("CONTRACT_REVERT").is_retriable());
        assert!(!gateway("INVALID_SIGNATURE").is_retriable());
        assert!(gateway("PAYER_ACCOUNT_NOT_FOUND").is_retriable());
        assert!(gateway("BUSY").is_retriable());
        assert!(LedgerError::Rpc("connection refused".into()).is_retriable());
        assert!(!LedgerError::Decode("short word".into()).is_retriable());
    }
}
