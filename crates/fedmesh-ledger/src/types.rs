// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use crate::{abi, error::LedgerError};

/// Mirror of the on-chain task record.  The ledger owns this; the client
/// holds a cached projection refreshed by view queries and events.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub task_id: u64,
    pub depositor: String,
    /// Content hash of the model artifact in the object store.
    pub model_ref: String,
    /// Content hash of the dataset manifest.
    pub dataset_ref: String,
    pub total_chunks: u32,
    pub remaining_chunks: u32,
    pub per_chunk_reward: u128,
    pub exists: bool,
}

impl Task {
    /// Decode the `getTask` view result:
    /// `(depositor, modelRef, datasetRef, totalChunks, remainingChunks,
    ///   perChunkReward, exists)` as seven words.
    pub fn decode(task_id: u64, data: &str) -> Result<Self, LedgerError> {
        let mut r = abi::WordReader::from_hex(data)?;
        let depositor = r.address()?;
        let model_ref = r.bytes32_hex()?;
        let dataset_ref = r.bytes32_hex()?;
        let total_chunks = u32::try_from(r.u64()?)
            .map_err(|_| LedgerError::Decode("totalChunks overflows u32".into()))?;
        let remaining_chunks = u32::try_from(r.u64()?)
            .map_err(|_| LedgerError::Decode("remainingChunks overflows u32".into()))?;
        let per_chunk_reward = r.u128()?;
        let exists = r.bool()?;

        if remaining_chunks > total_chunks {
            return Err(LedgerError::Decode(format!(
                "task {task_id}: remaining {remaining_chunks} > total {total_chunks}"
            )));
        }

        Ok(Self {
            task_id,
            depositor,
            model_ref,
            dataset_ref,
            total_chunks,
            remaining_chunks,
            per_chunk_reward,
            exists,
        })
    }
}

/// Decoded contract event, filtered to one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TaskEvent {
    Created {
        task_id: u64,
        depositor: String,
    },
    WeightsSubmitted {
        task_id: u64,
        trainer: String,
        weights_hash: String,
        reward: u128,
        remaining: u32,
    },
    Completed {
        task_id: u64,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> u64 {
        match self {
            TaskEvent::Created { task_id, .. }
            | TaskEvent::WeightsSubmitted { task_id, .. }
            | TaskEvent::Completed { task_id } => *task_id,
        }
    }
}

/// Accepted-transaction receipt from the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct Receipt {
    pub status: String,
    #[serde(default)]
    pub transaction_hash: String,
}

/// One raw contract log as served by the mirror endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MirrorLog {
    pub topics: Vec<String>,
    pub data: String,
    pub transaction_hash: String,
    pub log_index: u64,
}

/// Page shape of `GET {mirror}/contracts/{id}/logs`.
#[derive(Debug, Deserialize)]
pub struct MirrorLogPage {
    pub logs: Vec<MirrorLog>,
}

impl MirrorLog {
    /// Deduplication key: a transaction can carry several logs.
    pub fn key(&self) -> (String, u64) {
        (self.transaction_hash.clone(), self.log_index)
    }

    /// Decode against the contract event ABI.  `Ok(None)` for events of
    /// other contracts sharing the mirror stream; decode failures on a
    /// recognized topic are real errors.
    pub fn decode(&self) -> Result<Option<TaskEvent>, LedgerError> {
        let Some(topic0) = self.topics.first() else {
            return Ok(None);
        };

        if *topic0 == abi::event_topic(abi::TASK_CREATED_SIG) {
            let mut r = abi::WordReader::from_hex(&self.data)?;
            return Ok(Some(TaskEvent::Created {
                task_id: r.u64()?,
                depositor: r.address()?,
            }));
        }
        if *topic0 == abi::event_topic(abi::WEIGHTS_SUBMITTED_SIG) {
            let mut r = abi::WordReader::from_hex(&self.data)?;
            return Ok(Some(TaskEvent::WeightsSubmitted {
                task_id: r.u64()?,
                trainer: r.address()?,
                weights_hash: r.bytes32_hex()?,
                reward: r.u128()?,
                remaining: u32::try_from(r.u64()?)
                    .map_err(|_| LedgerError::Decode("remaining overflows u32".into()))?,
            }));
        }
        if *topic0 == abi::event_topic(abi::TASK_COMPLETED_SIG) {
            let mut r = abi::WordReader::from_hex(&self.data)?;
            return Ok(Some(TaskEvent::Completed { task_id: r.u64()? }));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{event_topic, word_bytes32, word_u128, word_u64, Word, WEIGHTS_SUBMITTED_SIG};

    fn words_hex(words: &[Word]) -> String {
        let mut raw = Vec::new();
        for w in words {
            raw.extend_from_slice(w);
        }
        format!("0x{}", hex::encode(raw))
    }

    fn address_word(byte: u8) -> Word {
        let mut w = [0u8; 32];
        w[12..].copy_from_slice(&[byte; 20]);
        w
    }

    #[test]
    fn weights_submitted_log_decodes() {
        let hash = "cd".repeat(32);
        let log = MirrorLog {
            topics: vec![event_topic(WEIGHTS_SUBMITTED_SIG)],
            data: words_hex(&[
                word_u64(3),
                address_word(0x22),
                word_bytes32(&hash).unwrap(),
                word_u128(10_000_000),
                word_u64(2),
            ]),
            transaction_hash: "0xdeadbeef".into(),
            log_index: 0,
        };

        let event = log.decode().unwrap().unwrap();
        assert_eq!(
            event,
            TaskEvent::WeightsSubmitted {
                task_id: 3,
                trainer: format!("0x{}", "22".repeat(20)),
                weights_hash: hash,
                reward: 10_000_000,
                remaining: 2,
            }
        );
    }

    #[test]
    fn foreign_event_topics_are_skipped() {
        let log = MirrorLog {
            topics: vec![event_topic("Transfer(address,address,uint256)")],
            data: words_hex(&[word_u64(1)]),
            transaction_hash: "0x1".into(),
            log_index: 0,
        };
        assert_eq!(log.decode().unwrap(), None);
    }

    #[test]
    fn task_view_decodes_and_checks_the_remaining_invariant() {
        let data = words_hex(&[
            address_word(0x33),
            word_bytes32(&"aa".repeat(32)).unwrap(),
            word_bytes32(&"bb".repeat(32)).unwrap(),
            word_u64(3),
            word_u64(1),
            word_u128(10_000_000),
            word_u64(1),
        ]);
        let task = Task::decode(9, &data).unwrap();
        assert_eq!(task.total_chunks, 3);
        assert_eq!(task.remaining_chunks, 1);
        assert!(task.exists);

        // remaining > total is an invariant violation, not a task.
        let bad = words_hex(&[
            address_word(0x33),
            word_bytes32(&"aa".repeat(32)).unwrap(),
            word_bytes32(&"bb".repeat(32)).unwrap(),
            word_u64(1),
            word_u64(5),
            word_u128(1),
            word_u64(1),
        ]);
        assert!(Task::decode(9, &bad).is_err());
    }
}
