// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Client-side round state.
//!
//! Exclusively owned by the client state-machine task; HTTP handlers and the
//! ledger observer only ever reach it through queued events.  The ledger is
//! the source of truth for submission progress — this mirror exists to
//! attribute on-chain events to chunks and peers and to know when to settle.

use std::collections::HashMap;

use fedmesh_ledger::Task;
use fedmesh_p2p::{ChunkAssignment, PeerId, PeerRecord};

use crate::error::NodeError;

/// Per-chunk progress.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkState {
    Unassigned,
    Assigned { trainer: PeerId },
    Submitted { trainer: PeerId, weights_hash: String },
}

/// Outcome of folding one `WeightsSubmitted` observation into the round.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribution {
    /// The submission maps to a specific assigned chunk.
    Chunk { chunk: u32, trainer: PeerId },
    /// The submitting account is not an assembled trainer (or submitted more
    /// than its share).  Still counted — the ledger accepted it.
    Unattributed,
}

#[derive(Debug)]
pub struct RoundState {
    pub task: Task,
    pub topic: String,
    /// Frozen at `train`, ascending by peer id.
    pub trainers: Vec<PeerId>,
    pub assignments: Vec<ChunkAssignment>,
    pub chunks: Vec<ChunkState>,
    pub session_pub_key: String,
    /// Every weights hash observed on-chain for this task, in order.
    pub observed_hashes: Vec<String>,
    /// Ledger-reported remaining chunk count; monotonically non-increasing.
    pub remaining: u32,
    /// Lowercased ledger account → trainer peer, from role announcements.
    accounts: HashMap<String, PeerId>,
    /// How many submissions each trainer has been credited with, used to
    /// attribute the k-th submission to the k-th assigned chunk.
    credited: HashMap<PeerId, usize>,
}

impl RoundState {
    /// A round in assembly: the topic is open, no work distributed yet.
    pub fn assembling(task: Task, topic: String) -> Self {
        let remaining = task.remaining_chunks;
        Self {
            task,
            topic,
            trainers: Vec::new(),
            assignments: Vec::new(),
            chunks: Vec::new(),
            session_pub_key: String::new(),
            observed_hashes: Vec::new(),
            remaining,
            accounts: HashMap::new(),
            credited: HashMap::new(),
        }
    }

    /// Freeze the candidate set and distribute chunks round-robin.
    ///
    /// Candidates arrive as mesh records; order is normalized to ascending
    /// peer id so every node derives the same assignment from the same set.
    pub fn freeze(&mut self, candidates: &[PeerRecord], session_pub_key: String) -> Result<(), NodeError> {
        if candidates.is_empty() {
            return Err(NodeError::NoTrainers);
        }
        let mut trainers: Vec<&PeerRecord> = candidates.iter().collect();
        trainers.sort_by_key(|r| r.peer_id.to_base58());

        self.trainers = trainers.iter().map(|r| r.peer_id).collect();
        self.accounts = trainers
            .iter()
            .filter_map(|r| {
                r.account
                    .as_ref()
                    .map(|a| (a.to_ascii_lowercase(), r.peer_id))
            })
            .collect();
        self.assignments = assign_round_robin(self.task.total_chunks, &self.trainers);
        self.chunks = (0..self.task.total_chunks)
            .map(|i| ChunkState::Assigned {
                trainer: self.trainers[i as usize % self.trainers.len()],
            })
            .collect();
        self.session_pub_key = session_pub_key;
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        !self.assignments.is_empty()
    }

    /// Fold one on-chain submission into the round.
    pub fn record_submission(
        &mut self,
        account: &str,
        weights_hash: &str,
        remaining_after: u32,
    ) -> Attribution {
        if !self.observed_hashes.iter().any(|h| h == weights_hash) {
            self.observed_hashes.push(weights_hash.to_string());
        }
        // Ledger observation is monotonically non-decreasing in progress.
        self.remaining = self.remaining.min(remaining_after);

        let Some(&trainer) = self.accounts.get(&account.to_ascii_lowercase()) else {
            return Attribution::Unattributed;
        };

        let own_chunks: Vec<u32> = self
            .assignments
            .iter()
            .filter(|a| a.trainer == trainer.to_base58())
            .map(|a| a.chunk)
            .collect();

        let k = self.credited.entry(trainer).or_insert(0);
        let Some(&chunk) = own_chunks.get(*k) else {
            return Attribution::Unattributed;
        };
        *k += 1;

        let slot = &mut self.chunks[chunk as usize];
        if matches!(slot, ChunkState::Submitted { .. }) {
            // First observation wins; a duplicate for the same chunk is
            // counted but changes nothing.
            return Attribution::Unattributed;
        }
        *slot = ChunkState::Submitted {
            trainer,
            weights_hash: weights_hash.to_string(),
        };
        Attribution::Chunk { chunk, trainer }
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// True once every frozen trainer has at least one on-chain submission —
    /// the signal to stop re-emitting the assignment message.
    pub fn all_trainers_submitted(&self) -> bool {
        self.is_frozen()
            && self
                .trainers
                .iter()
                .all(|t| self.credited.get(t).is_some_and(|k| *k > 0))
    }

    /// Chunk indices still awaiting an on-chain submission.
    pub fn unsubmitted(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, s)| !matches!(s, ChunkState::Submitted { .. }))
            .map(|(i, _)| i as u32)
            .collect()
    }
}

/// Deterministic round-robin assignment of `[0..total)` over trainers in
/// the given (already sorted) order.
pub fn assign_round_robin(total: u32, trainers: &[PeerId]) -> Vec<ChunkAssignment> {
    (0..total)
        .map(|chunk| ChunkAssignment {
            chunk,
            trainer: trainers[chunk as usize % trainers.len()].to_base58(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Instant;

    use fedmesh_p2p::NodeRole;

    fn task(total: u32) -> Task {
        Task {
            task_id: 1,
            depositor: format!("0x{}", "00".repeat(20)),
            model_ref: "aa".repeat(32),
            dataset_ref: "bb".repeat(32),
            total_chunks: total,
            remaining_chunks: total,
            per_chunk_reward: 10_000_000,
            exists: true,
        }
    }

    fn trainer_record(account_byte: u8) -> PeerRecord {
        PeerRecord {
            peer_id: PeerId::random(),
            role: NodeRole::Trainer,
            topics: BTreeSet::new(),
            addr: None,
            account: Some(format!("0x{}", hex_byte(account_byte).repeat(20))),
            last_seen: Instant::now(),
        }
    }

    fn hex_byte(b: u8) -> String {
        format!("{b:02x}")
    }

    fn sorted_ids(records: &[PeerRecord]) -> Vec<String> {
        let mut ids: Vec<String> = records.iter().map(|r| r.peer_id.to_base58()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn single_chunk_single_trainer() {
        let mut round = RoundState::assembling(task(1), "1".into());
        let t = trainer_record(0x10);
        round.freeze(&[t.clone()], "04ab".into()).unwrap();
        assert_eq!(round.assignments.len(), 1);
        assert_eq!(round.assignments[0].trainer, t.peer_id.to_base58());

        let att = round.record_submission(t.account.as_deref().unwrap(), &"cc".repeat(32), 0);
        assert_eq!(att, Attribution::Chunk { chunk: 0, trainer: t.peer_id });
        assert!(round.is_complete());
    }

    #[test]
    fn round_robin_is_deterministic_and_bounded() {
        let records = vec![trainer_record(0x01), trainer_record(0x02), trainer_record(0x03)];
        let mut a = RoundState::assembling(task(8), "1".into());
        a.freeze(&records, "k".into()).unwrap();
        let mut b = RoundState::assembling(task(8), "1".into());
        // Different input order, same frozen set.
        let reversed: Vec<PeerRecord> = records.iter().rev().cloned().collect();
        b.freeze(&reversed, "k".into()).unwrap();

        assert_eq!(a.assignments, b.assignments, "assignment must not depend on input order");

        // No chunk assigned twice, each trainer holds at most ceil(8/3).
        let chunks: BTreeSet<u32> = a.assignments.iter().map(|x| x.chunk).collect();
        assert_eq!(chunks.len(), 8);
        for id in sorted_ids(&records) {
            let share = a.assignments.iter().filter(|x| x.trainer == id).count();
            assert!(share <= 3, "trainer got {share} chunks");
        }
    }

    #[test]
    fn freezing_an_empty_candidate_set_is_no_trainers() {
        let mut round = RoundState::assembling(task(3), "1".into());
        assert!(matches!(
            round.freeze(&[], "k".into()),
            Err(NodeError::NoTrainers)
        ));
        assert!(!round.is_frozen());
    }

    #[test]
    fn sequential_submissions_map_to_a_trainers_chunks_in_order() {
        // One trainer, three chunks: submissions credit chunks 0, 1, 2.
        let t = trainer_record(0x20);
        let mut round = RoundState::assembling(task(3), "1".into());
        round.freeze(std::slice::from_ref(&t), "k".into()).unwrap();

        let account = t.account.as_deref().unwrap();
        for (i, remaining) in [(0u32, 2u32), (1, 1), (2, 0)] {
            let att = round.record_submission(account, &format!("{:064x}", i + 1), remaining);
            assert_eq!(att, Attribution::Chunk { chunk: i, trainer: t.peer_id });
        }
        assert!(round.is_complete());
        assert!(round.unsubmitted().is_empty());
        assert_eq!(round.observed_hashes.len(), 3);
    }

    #[test]
    fn unknown_account_still_counts_toward_completion() {
        let t = trainer_record(0x30);
        let mut round = RoundState::assembling(task(1), "1".into());
        round.freeze(std::slice::from_ref(&t), "k".into()).unwrap();

        let att = round.record_submission(&format!("0x{}", "ff".repeat(20)), &"dd".repeat(32), 0);
        assert_eq!(att, Attribution::Unattributed);
        assert!(round.is_complete(), "ledger-accepted submissions always count");
        assert_eq!(round.unsubmitted(), vec![0], "but the chunk stays unattributed");
    }

    #[test]
    fn remaining_never_increases() {
        let t = trainer_record(0x40);
        let mut round = RoundState::assembling(task(3), "1".into());
        round.freeze(std::slice::from_ref(&t), "k".into()).unwrap();
        let account = t.account.clone().unwrap();

        round.record_submission(&account, &"aa".repeat(32), 1);
        assert_eq!(round.remaining, 1);
        // A stale observation cannot move progress backwards.
        round.record_submission(&account, &"bb".repeat(32), 2);
        assert_eq!(round.remaining, 1);
    }
}
