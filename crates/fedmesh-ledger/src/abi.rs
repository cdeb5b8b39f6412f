// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Minimal contract ABI: Keccak-256 selectors and 32-byte word packing.
//!
//! The training-escrow contract uses a fixed, small ABI (no dynamic types),
//! so calldata and event data are flat sequences of 32-byte words.  This
//! module is the single place that knows the layouts.

use sha3::{Digest, Keccak256};

use crate::error::LedgerError;

pub const SUBMIT_WEIGHTS_SIG: &str = "submitWeights(uint64,bytes32)";
pub const GET_TASK_SIG: &str = "getTask(uint64)";
pub const GET_TASK_ID_SIG: &str = "getTaskId()";

pub const TASK_CREATED_SIG: &str = "TaskCreated(uint64,address)";
pub const WEIGHTS_SUBMITTED_SIG: &str = "WeightsSubmitted(uint64,address,bytes32,uint256,uint64)";
pub const TASK_COMPLETED_SIG: &str = "TaskCompleted(uint64)";

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// 4-byte function selector.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// `0x`-prefixed event topic for a signature, as the mirror serves it.
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(keccak256(signature.as_bytes())))
}

// ── Encoding ──────────────────────────────────────────────────────────────────

pub type Word = [u8; 32];

pub fn word_u64(v: u64) -> Word {
    let mut w = [0u8; 32];
    w[24..].copy_from_slice(&v.to_be_bytes());
    w
}

pub fn word_u128(v: u128) -> Word {
    let mut w = [0u8; 32];
    w[16..].copy_from_slice(&v.to_be_bytes());
    w
}

/// A 32-byte value given as 64 hex characters (the on-chain form of content
/// hashes).
pub fn word_bytes32(hex_str: &str) -> Result<Word, LedgerError> {
    let raw = hex::decode(hex_str.trim_start_matches("0x"))
        .map_err(|e| LedgerError::Decode(format!("bytes32: {e}")))?;
    if raw.len() != 32 {
        return Err(LedgerError::Decode(format!(
            "bytes32: expected 32 bytes, got {}",
            raw.len()
        )));
    }
    let mut w = [0u8; 32];
    w.copy_from_slice(&raw);
    Ok(w)
}

/// Calldata: selector followed by the argument words.
pub fn encode_call(signature: &str, words: &[Word]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 32 * words.len());
    out.extend_from_slice(&selector(signature));
    for w in words {
        out.extend_from_slice(w);
    }
    out
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Sequential reader over `0x`-hex-encoded word data.
pub struct WordReader {
    data: Vec<u8>,
    pos: usize,
}

impl WordReader {
    pub fn from_hex(data: &str) -> Result<Self, LedgerError> {
        let raw = hex::decode(data.trim_start_matches("0x"))
            .map_err(|e| LedgerError::Decode(format!("word data: {e}")))?;
        if raw.len() % 32 != 0 {
            return Err(LedgerError::Decode(format!(
                "word data length {} is not a multiple of 32",
                raw.len()
            )));
        }
        Ok(Self { data: raw, pos: 0 })
    }

    fn word(&mut self) -> Result<&[u8], LedgerError> {
        if self.pos + 32 > self.data.len() {
            return Err(LedgerError::Decode("unexpected end of word data".into()));
        }
        let w = &self.data[self.pos..self.pos + 32];
        self.pos += 32;
        Ok(w)
    }

    pub fn u64(&mut self) -> Result<u64, LedgerError> {
        let w = self.word()?;
        if w[..24].iter().any(|b| *b != 0) {
            return Err(LedgerError::Decode("u64 word overflows".into()));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&w[24..]);
        Ok(u64::from_be_bytes(buf))
    }

    pub fn u128(&mut self) -> Result<u128, LedgerError> {
        let w = self.word()?;
        if w[..16].iter().any(|b| *b != 0) {
            return Err(LedgerError::Decode("u128 word overflows".into()));
        }
        let mut buf = [0u8; 16];
        buf.copy_from_slice(&w[16..]);
        Ok(u128::from_be_bytes(buf))
    }

    pub fn bool(&mut self) -> Result<bool, LedgerError> {
        Ok(self.u64()? != 0)
    }

    /// Right-aligned 20-byte account address, `0x`-prefixed.
    pub fn address(&mut self) -> Result<String, LedgerError> {
        let w = self.word()?;
        Ok(format!("0x{}", hex::encode(&w[12..])))
    }

    /// Full 32-byte word as bare 64-hex (content-hash convention).
    pub fn bytes32_hex(&mut self) -> Result<String, LedgerError> {
        let w = self.word()?;
        Ok(hex::encode(w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_matches_known_vector() {
        // Keccak-256 of the empty input.
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn call_encoding_round_trips_through_the_reader() {
        let hash = "ab".repeat(32);
        let calldata = encode_call(
            SUBMIT_WEIGHTS_SIG,
            &[word_u64(42), word_bytes32(&hash).unwrap()],
        );
        assert_eq!(calldata.len(), 4 + 64);
        assert_eq!(&calldata[..4], &selector(SUBMIT_WEIGHTS_SIG));

        let mut r = WordReader::from_hex(&hex::encode(&calldata[4..])).unwrap();
        assert_eq!(r.u64().unwrap(), 42);
        assert_eq!(r.bytes32_hex().unwrap(), hash);
    }

    #[test]
    fn u64_word_rejects_overflow() {
        let mut r = WordReader::from_hex(&hex::encode(word_u128(u128::from(u64::MAX) + 1))).unwrap();
        assert!(r.u64().is_err());
    }

    #[test]
    fn address_is_right_aligned() {
        let mut w = [0u8; 32];
        w[12..].copy_from_slice(&[0x11; 20]);
        let mut r = WordReader::from_hex(&hex::encode(w)).unwrap();
        assert_eq!(r.address().unwrap(), format!("0x{}", "11".repeat(20)));
    }

    #[test]
    fn ragged_word_data_is_rejected() {
        assert!(WordReader::from_hex("0xabcd").is_err());
    }

    #[test]
    fn event_topics_are_distinct() {
        let topics = [
            event_topic(TASK_CREATED_SIG),
            event_topic(WEIGHTS_SUBMITTED_SIG),
            event_topic(TASK_COMPLETED_SIG),
        ];
        assert_ne!(topics[0], topics[1]);
        assert_ne!(topics[1], topics[2]);
        assert!(topics.iter().all(|t| t.len() == 66));
    }
}
