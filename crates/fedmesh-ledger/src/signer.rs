// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! ECDSA secp256k1 operator signing.
//!
//! The gateway authenticates contract calls by verifying a deterministic
//! (RFC 6979) signature over the Keccak-256 digest of the calldata against
//! the operator's registered public key.

use k256::ecdsa::{signature::hazmat::PrehashSigner, Signature, SigningKey, VerifyingKey};

use crate::error::LedgerError;

pub struct OperatorSigner {
    key: SigningKey,
}

impl std::fmt::Debug for OperatorSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug formatting.
        f.debug_struct("OperatorSigner").finish_non_exhaustive()
    }
}

impl OperatorSigner {
    /// Build from the 64-hex `OPERATOR_KEY` form.
    pub fn from_hex(hex_key: &str) -> Result<Self, LedgerError> {
        let raw = hex::decode(hex_key.trim_start_matches("0x"))
            .map_err(|e| LedgerError::InvalidKey(e.to_string()))?;
        let key = SigningKey::from_slice(&raw)
            .map_err(|e| LedgerError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Sign a 32-byte digest; returns the 64-byte compact signature as hex.
    pub fn sign_digest32(&self, digest: &[u8; 32]) -> Result<String, LedgerError> {
        let sig: Signature = self
            .key
            .sign_prehash(digest)
            .map_err(|e| LedgerError::Signer(e.to_string()))?;
        Ok(hex::encode(sig.to_bytes()))
    }

    /// Uncompressed SEC1 public key as hex (`04…`), sent alongside each call.
    pub fn public_key_hex(&self) -> String {
        let vk = VerifyingKey::from(&self.key);
        hex::encode(vk.to_encoded_point(false).as_bytes())
    }

    /// Ledger account address: last 20 bytes of the Keccak-256 of the
    /// uncompressed public key, `0x`-prefixed.  This is the form the
    /// contract's `WeightsSubmitted` event reports for the submitting
    /// trainer.
    pub fn address(&self) -> String {
        let vk = VerifyingKey::from(&self.key);
        let point = vk.to_encoded_point(false);
        // Skip the 0x04 SEC1 tag byte.
        let digest = crate::abi::keccak256(&point.as_bytes()[1..]);
        format!("0x{}", hex::encode(&digest[12..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::signature::hazmat::PrehashVerifier;

    fn test_key() -> String {
        "7f".repeat(32)
    }

    #[test]
    fn signatures_verify_against_the_public_key() {
        let signer = OperatorSigner::from_hex(&test_key()).unwrap();
        let digest = crate::abi::keccak256(b"payload");

        let sig_hex = signer.sign_digest32(&digest).unwrap();
        let sig = Signature::from_slice(&hex::decode(&sig_hex).unwrap()).unwrap();

        let pk_bytes = hex::decode(signer.public_key_hex()).unwrap();
        let vk = VerifyingKey::from_sec1_bytes(&pk_bytes).unwrap();
        assert!(vk.verify_prehash(&digest, &sig).is_ok());
    }

    #[test]
    fn signing_is_deterministic() {
        let signer = OperatorSigner::from_hex(&test_key()).unwrap();
        let digest = crate::abi::keccak256(b"same payload");
        assert_eq!(
            signer.sign_digest32(&digest).unwrap(),
            signer.sign_digest32(&digest).unwrap(),
            "RFC 6979 signatures must be reproducible"
        );
    }

    #[test]
    fn malformed_key_is_rejected() {
        assert!(OperatorSigner::from_hex("zz").is_err());
        assert!(OperatorSigner::from_hex("ab").is_err());
    }

    #[test]
    fn address_is_stable_and_well_formed() {
        let a = OperatorSigner::from_hex(&test_key()).unwrap().address();
        let b = OperatorSigner::from_hex(&test_key()).unwrap().address();
        assert_eq!(a, b);
        assert!(a.starts_with("0x"));
        assert_eq!(a.len(), 42);
    }

    #[test]
    fn debug_does_not_leak_the_key() {
        let signer = OperatorSigner::from_hex(&test_key()).unwrap();
        let repr = format!("{signer:?}");
        assert!(!repr.contains("7f7f"));
    }
}
