// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! HTTP client for the ledger gateway and mirror.
//!
//! Two endpoints, two jobs: the *gateway* executes signed contract calls and
//! answers view queries; the *mirror* serves the recent contract log window
//! that the event observer polls.  The adapter is stateless per call — every
//! method builds its own request — so it is shared freely behind an `Arc`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, MissedTickBehavior};

use fedmesh_config::LedgerEnv;

use crate::{
    abi,
    error::LedgerError,
    signer::OperatorSigner,
    types::{MirrorLog, MirrorLogPage, Receipt, Task, TaskEvent},
};

/// Mirror poll cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Bounded recent window re-read on every poll; dedup absorbs the overlap.
const POLL_WINDOW: u32 = 100;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct LedgerClient {
    http: reqwest::Client,
    gateway: String,
    mirror: String,
    operator_id: String,
    contract_id: String,
    topic_id: String,
    signer: OperatorSigner,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    result: String,
}

#[derive(Debug, Deserialize)]
struct GatewayFailure {
    status: String,
    #[serde(default)]
    message: String,
}

impl LedgerClient {
    pub fn new(env: &LedgerEnv) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;
        Ok(Self {
            http,
            gateway: env.gateway_url.trim_end_matches('/').to_string(),
            mirror: env.mirror_url.trim_end_matches('/').to_string(),
            operator_id: env.operator_id.clone(),
            contract_id: env.contract_id.clone(),
            topic_id: env.topic_id.clone(),
            signer: OperatorSigner::from_hex(&env.operator_key)?,
        })
    }

    /// Ledger account address of this node's operator key; trainers announce
    /// it so the client can attribute `WeightsSubmitted` events to peers.
    pub fn account_address(&self) -> String {
        self.signer.address()
    }

    /// Cheap reachability probe used at startup (exit code 3 on failure).
    pub async fn ping(&self) -> Result<(), LedgerError> {
        self.fetch_log_page(1).await.map(|_| ())
    }

    // ── Contract calls ────────────────────────────────────────────────────────

    /// Submit a trained-weights content hash for `task_id`.  The contract
    /// decrements `remainingChunks`, pays the reward, and emits
    /// `WeightsSubmitted`.  Transport failures and non-terminal gateway
    /// statuses are retried; a `CONTRACT_REVERT` or `INVALID_SIGNATURE`
    /// aborts with that reason.
    pub async fn submit_weights(
        &self,
        task_id: u64,
        weights_hash: &str,
    ) -> Result<Receipt, LedgerError> {
        let calldata = abi::encode_call(
            abi::SUBMIT_WEIGHTS_SIG,
            &[abi::word_u64(task_id), abi::word_bytes32(weights_hash)?],
        );
        self.retrying("submitWeights", || self.execute(calldata.clone()))
            .await
    }

    /// `getTask` contract view.
    pub async fn get_task(&self, task_id: u64) -> Result<Task, LedgerError> {
        let calldata = abi::encode_call(abi::GET_TASK_SIG, &[abi::word_u64(task_id)]);
        let data = self.retrying("getTask", || self.query(calldata.clone())).await?;
        Task::decode(task_id, &data)
    }

    /// `getTaskId` contract view: the most recently assigned task id.
    pub async fn get_task_id(&self) -> Result<u64, LedgerError> {
        let calldata = abi::encode_call(abi::GET_TASK_ID_SIG, &[]);
        let data = self.retrying("getTaskId", || self.query(calldata.clone())).await?;
        abi::WordReader::from_hex(&data)?.u64()
    }

    async fn execute(&self, calldata: Vec<u8>) -> Result<Receipt, LedgerError> {
        let digest = abi::keccak256(&calldata);
        let body = serde_json::json!({
            "operatorId": self.operator_id,
            "publicKey": self.signer.public_key_hex(),
            "calldata": format!("0x{}", hex::encode(&calldata)),
            "signature": self.signer.sign_digest32(&digest)?,
        });
        let url = format!("{}/contracts/{}/execute", self.gateway, self.contract_id);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;
        let receipt: Receipt = Self::decode_response(resp).await?;
        if receipt.status != "SUCCESS" {
            return Err(LedgerError::Gateway {
                status: receipt.status,
                message: "transaction rejected".into(),
            });
        }
        Ok(receipt)
    }

    async fn query(&self, calldata: Vec<u8>) -> Result<String, LedgerError> {
        let body = serde_json::json!({
            "calldata": format!("0x{}", hex::encode(&calldata)),
        });
        let url = format!("{}/contracts/{}/query", self.gateway, self.contract_id);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;
        let q: QueryResponse = Self::decode_response(resp).await?;
        Ok(q.result)
    }

    // ── Consensus-topic log ──────────────────────────────────────────────────

    /// Append a human-readable line to the shared log topic.  Best-effort:
    /// callers log failures and move on, the round never depends on it.
    pub async fn publish_log(&self, message: &str) -> Result<(), LedgerError> {
        let url = format!("{}/topics/{}/messages", self.gateway, self.topic_id);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "message": message }))
            .send()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(LedgerError::Rpc(format!("topic append: HTTP {}", resp.status())));
        }
        Ok(())
    }

    // ── Event observation ────────────────────────────────────────────────────

    /// One-shot read of the recent log window, decoded and filtered to
    /// `task_id`, oldest first.  Used for restart catch-up before the
    /// periodic observer takes over.
    pub async fn fetch_task_events(&self, task_id: u64) -> Result<Vec<TaskEvent>, LedgerError> {
        let page = self.fetch_log_page(POLL_WINDOW).await?;
        let mut seen = HashSet::new();
        Ok(fold_logs(&mut seen, page.logs, task_id))
    }

    /// Spawn the 5-second mirror poller for `task_id`.  Events arrive on the
    /// returned channel in chronological order, deduplicated by
    /// `(transaction_hash, log_index)`; the task stops when the receiver is
    /// dropped.
    pub fn spawn_observer(self: &Arc<Self>, task_id: u64) -> mpsc::Receiver<TaskEvent> {
        let (tx, rx) = mpsc::channel(64);
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut seen: HashSet<(String, u64)> = HashSet::new();
            let mut ticker = interval_at(tokio::time::Instant::now(), POLL_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let page = match client.fetch_log_page(POLL_WINDOW).await {
                    Ok(page) => page,
                    Err(e) => {
                        tracing::debug!("mirror poll failed: {e}");
                        continue;
                    }
                };
                for event in fold_logs(&mut seen, page.logs, task_id) {
                    if tx.send(event).await.is_err() {
                        tracing::debug!("observer for task {task_id} closed");
                        return;
                    }
                }
            }
        });
        rx
    }

    async fn fetch_log_page(&self, limit: u32) -> Result<MirrorLogPage, LedgerError> {
        let url = format!(
            "{}/contracts/{}/logs?limit={limit}&order=desc",
            self.mirror, self.contract_id
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;
        Self::decode_response(resp).await
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    async fn decode_response<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, LedgerError> {
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;

        if !status.is_success() {
            // The gateway reports contract-level rejections as structured
            // JSON; anything else is transport noise.
            if let Ok(failure) = serde_json::from_str::<GatewayFailure>(&text) {
                return Err(LedgerError::Gateway {
                    status: failure.status,
                    message: failure.message,
                });
            }
            return Err(LedgerError::Rpc(format!("HTTP {status}: {text}")));
        }

        serde_json::from_str(&text).map_err(|e| LedgerError::Decode(e.to_string()))
    }

    async fn retrying<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, LedgerError>>,
    {
        let mut last = None;
        for attempt in 1..=RETRY_ATTEMPTS {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retriable() && attempt < RETRY_ATTEMPTS => {
                    tracing::warn!("{what} attempt {attempt} failed: {e}; retrying");
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| LedgerError::Rpc(format!("{what}: no attempt made"))))
    }
}

/// Decode a mirror page into new task events, oldest first.
///
/// `seen` carries the dedup state across polls; logs already seen, logs of
/// other tasks, and foreign contract events all fold to nothing.
fn fold_logs(
    seen: &mut HashSet<(String, u64)>,
    logs: Vec<MirrorLog>,
    task_id: u64,
) -> Vec<TaskEvent> {
    let mut events = Vec::new();
    // The mirror serves newest-first; deliver oldest-first.
    for log in logs.into_iter().rev() {
        if !seen.insert(log.key()) {
            continue;
        }
        match log.decode() {
            Ok(Some(event)) if event.task_id() == task_id => events.push(event),
            Ok(_) => {}
            Err(e) => tracing::debug!("undecodable mirror log {}: {e}", log.transaction_hash),
        }
    }
    events
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

    fn submission_log(task_id: u64, tx: &str, index: u64, remaining: u64) -> MirrorLog {
        let mut trainer = [0u8; 32];
        trainer[12..].copy_from_slice(&[0x44; 20]);
        MirrorLog {
            topics: vec![event_topic(WEIGHTS_SUBMITTED_SIG)],
            data: words_hex(&[
                word_u64(task_id),
                trainer,
                word_bytes32(&"ee".repeat(32)).unwrap(),
                word_u128(10_000_000),
                word_u64(remaining),
            ]),
            transaction_hash: tx.into(),
            log_index: index,
        }
    }

    #[test]
    fn fold_is_oldest_first_and_filters_by_task() {
        let mut seen = HashSet::new();
        // Mirror order: newest first.
        let logs = vec![
            submission_log(1, "0xc", 0, 0),
            submission_log(2, "0xb", 0, 4),
            submission_log(1, "0xa", 0, 1),
        ];
        let events = fold_logs(&mut seen, logs, 1);
        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (
                TaskEvent::WeightsSubmitted { remaining: r0, .. },
                TaskEvent::WeightsSubmitted { remaining: r1, .. },
            ) => {
                assert_eq!((*r0, *r1), (1, 0), "events must arrive oldest first");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn replayed_window_does_not_double_credit() {
        let mut seen = HashSet::new();
        let logs = vec![submission_log(1, "0xa", 0, 2), submission_log(1, "0xa", 1, 1)];
        assert_eq!(fold_logs(&mut seen, logs.clone(), 1).len(), 2);
        // The next poll re-reads the same window.
        assert_eq!(fold_logs(&mut seen, logs, 1).len(), 0);
    }

    #[test]
    fn same_transaction_different_log_index_is_two_events() {
        let mut seen = HashSet::new();
        let logs = vec![submission_log(1, "0xa", 1, 1), submission_log(1, "0xa", 0, 2)];
        assert_eq!(fold_logs(&mut seen, logs, 1).len(), 2);
    }
}
