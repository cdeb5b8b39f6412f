// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Session key seam for a round.
//!
//! The on-chain content hash is the authoritative reference to trained
//! weights; encrypting weight references with a per-round session key is an
//! optional layer on top.  The seam is kept as a trait so an encrypting
//! implementation can be slotted in without touching the round protocol;
//! the identity implementation is used when the session key is unused.

use crate::error::NodeError;

/// Asymmetric session cipher held by the client for one round.
pub trait SessionCipher: Send + Sync {
    /// Decrypt a ciphertext produced against this session's public key.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, NodeError>;

    /// Public half, distributed to trainers in the `Assign` message.
    fn public_key_bytes(&self) -> Vec<u8>;
}

/// Pass-through cipher: `decrypt` is the identity and the public key is
/// whatever opaque string the UI supplied with the `train` command.
pub struct IdentityCipher {
    public_key: Vec<u8>,
}

impl IdentityCipher {
    pub fn new(public_key: impl Into<Vec<u8>>) -> Self {
        Self { public_key: public_key.into() }
    }
}

impl SessionCipher for IdentityCipher {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, NodeError> {
        Ok(ciphertext.to_vec())
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_cipher_round_trips_anything() {
        let cipher = IdentityCipher::new(b"04beef".to_vec());
        let payload = b"weights-ref".to_vec();
        assert_eq!(cipher.decrypt(&payload).unwrap(), payload);
        assert_eq!(cipher.public_key_bytes(), b"04beef");
    }
}
