// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Client role: originates a round and drives it to settlement.
//!
//! State machine per task lifetime:
//!
//! ```text
//! Idle → Advertising → Assembling → Training → Settling → Done
//!   └────────────────────── any ──────────────────────→ Aborted
//! ```
//!
//! `Advertising` and `Settling` are transient within a single transition
//! here: the round-topic subscription is live by the time `advertize`
//! returns (so the state lands directly in `Assembling`), and settlement is
//! a bounded sequence of presign calls performed while moving to `Done`.
//!
//! The loop owns the `RoundState` exclusively.  HTTP commands and ledger
//! observations arrive on one queue; overlay events on the broadcast
//! channel; the assignment re-emit and the round deadline are timers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use fedmesh_ledger::{LedgerClient, TaskEvent};
use fedmesh_p2p::{
    NodeRole, OverlayEvent, OverlayHandle, PeerRecord, RoundMessage, DISCOVERY_TOPIC,
};
use fedmesh_store::{ObjectStore, DEFAULT_PRESIGN_TTL};

use crate::{
    command::{Command, CommandEnvelope},
    error::NodeError,
    roles::{shared_command, shutdown_signal},
    round::{Attribution, RoundState},
};

/// Assignment re-emit backoff: base 1 s, doubling, capped at 30 s.
const ASSIGN_BACKOFF_BASE: Duration = Duration::from_secs(1);
const ASSIGN_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Default wall-clock budget for a whole round.
pub const DEFAULT_ROUND_DEADLINE: Duration = Duration::from_secs(3600);

/// Everything the client loop can be woken by, on one queue.
#[derive(Debug)]
pub enum ClientEvent {
    Command(CommandEnvelope),
    Ledger(TaskEvent),
}

enum ClientState {
    Idle,
    Assembling(RoundState),
    Training(RoundState),
    Done { task_id: u64, weights_urls: Vec<String> },
    Aborted { task_id: u64, reason: String },
}

impl ClientState {
    fn name(&self) -> &'static str {
        match self {
            ClientState::Idle => "idle",
            ClientState::Assembling(_) => "assembling",
            ClientState::Training(_) => "training",
            ClientState::Done { .. } => "done",
            ClientState::Aborted { .. } => "aborted",
        }
    }
}

pub struct ClientNode {
    overlay: OverlayHandle,
    ledger: Arc<LedgerClient>,
    store: Arc<ObjectStore>,
    http: reqwest::Client,
    bootstrap_admin: Option<String>,
    event_tx: mpsc::Sender<ClientEvent>,
    state: ClientState,
    observer: Option<tokio::task::JoinHandle<()>>,
    round_deadline: Duration,
    deadline_at: Option<tokio::time::Instant>,
    next_assign_at: Option<tokio::time::Instant>,
    assign_delay: Duration,
    assign_message: Option<RoundMessage>,
}

impl ClientNode {
    pub fn new(
        overlay: OverlayHandle,
        ledger: Arc<LedgerClient>,
        store: Arc<ObjectStore>,
        bootstrap_admin: Option<String>,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (event_tx, event_rx) = mpsc::channel(128);
        let node = Self {
            overlay,
            ledger,
            store,
            http: reqwest::Client::new(),
            bootstrap_admin,
            event_tx,
            state: ClientState::Idle,
            observer: None,
            round_deadline: DEFAULT_ROUND_DEADLINE,
            deadline_at: None,
            next_assign_at: None,
            assign_delay: ASSIGN_BACKOFF_BASE,
            assign_message: None,
        };
        (node, event_rx)
    }

    /// Sender for the HTTP forwarder and any other event producer.
    pub fn event_sender(&self) -> mpsc::Sender<ClientEvent> {
        self.event_tx.clone()
    }

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<ClientEvent>) -> Result<(), NodeError> {
        let mut overlay_events = self.overlay.subscribe_events();
        tracing::info!("client ready; peer_id={}", self.overlay.local_peer_id());

        loop {
            let assign_at = self.next_assign_at;
            let deadline_at = self.deadline_at;

            tokio::select! {
                Some(event) = event_rx.recv() => match event {
                    ClientEvent::Command(env) => {
                        let result = self.handle_command(env.command).await;
                        let _ = env.reply.send(result);
                    }
                    ClientEvent::Ledger(ev) => self.on_ledger_event(ev).await,
                },
                event = overlay_events.recv() => match event {
                    Ok(ev) => self.on_overlay_event(ev),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("overlay event stream lagged by {n}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = sleep_until_opt(assign_at) => self.re_emit_assign().await,
                _ = sleep_until_opt(deadline_at) => self.on_deadline().await,
                _ = shutdown_signal() => {
                    tracing::info!("shutting down");
                    self.stop_observer();
                    self.overlay.shutdown().await;
                    break;
                }
            }
        }
        Ok(())
    }

    // ── Command handling ─────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> Result<Value, NodeError> {
        if let Some(result) =
            shared_command(&self.overlay, &self.http, self.bootstrap_admin.as_deref(), &cmd).await
        {
            return result;
        }
        match cmd {
            Command::Advertise { task_id } => self.cmd_advertise(task_id).await,
            Command::Train {
                task_id,
                model_hash,
                manifest_url,
                session_pub_key,
            } => self.cmd_train(task_id, model_hash, manifest_url, session_pub_key).await,
            Command::Status => Ok(self.status_json()),
            other => Err(NodeError::UnknownCommand(format!("{other:?} (client role)"))),
        }
    }

    /// `advertize <taskId>`: open the round topic for a funded task.
    ///
    /// Also the restart path: for a task with on-chain progress the state
    /// lands directly in `Training` (resuming the wait for the remaining
    /// submissions) or settles immediately when the task already completed.
    async fn cmd_advertise(&mut self, task_id: u64) -> Result<Value, NodeError> {
        if matches!(self.state, ClientState::Assembling(_) | ClientState::Training(_)) {
            return Err(NodeError::Invariant(
                "a round is already active on this node".into(),
            ));
        }

        let task = self.ledger.get_task(task_id).await?;

        if !task.exists {
            if task.total_chunks == 0 {
                return Err(NodeError::TaskMissing(task_id));
            }
            // Completed before we arrived (e.g. client restart after the
            // final submission): settle from ledger history.
            let hashes = self.submitted_hashes(task_id).await?;
            let urls = self.resolve_weight_urls(&hashes).await;
            self.log_round(&format!("task {task_id} already complete; settled")).await;
            self.state = ClientState::Done { task_id, weights_urls: urls.clone() };
            return Ok(json!({ "state": "done", "weights": urls }));
        }

        let topic = task_id.to_string();
        self.overlay.subscribe(&topic).await?;
        if let Err(e) = self
            .overlay
            .publish(DISCOVERY_TOPIC, RoundMessage::Advertise { task_id })
            .await
        {
            tracing::debug!("advertise publish: {e}");
        }
        self.log_round(&format!("advertised task {task_id} on topic {topic}")).await;

        let mut round = RoundState::assembling(task, topic.clone());

        if round.task.remaining_chunks < round.task.total_chunks {
            // Mid-round restart: credit history, resume awaiting the rest.
            for event in self.ledger.fetch_task_events(task_id).await.unwrap_or_default() {
                if let TaskEvent::WeightsSubmitted { trainer, weights_hash, remaining, .. } = event
                {
                    round.record_submission(&trainer, &weights_hash, remaining);
                }
            }
            let observed = round.observed_hashes.len();
            self.start_observer(task_id);
            self.deadline_at = Some(tokio::time::Instant::now() + self.round_deadline);
            self.state = ClientState::Training(round);
            tracing::info!("resumed task {task_id} with {observed} prior submissions");
            return Ok(json!({ "state": "training", "resumed": true, "observed": observed }));
        }

        self.state = ClientState::Assembling(round);
        Ok(json!({ "state": "assembling", "topic": topic }))
    }

    /// `train <taskId> <modelHash> <manifestURL> <pubKey>`: freeze the
    /// candidate set and distribute work.
    async fn cmd_train(
        &mut self,
        task_id: u64,
        model_hash: String,
        manifest_url: String,
        session_pub_key: String,
    ) -> Result<Value, NodeError> {
        match std::mem::replace(&mut self.state, ClientState::Idle) {
            ClientState::Assembling(mut round) => {
                if round.task.task_id != task_id {
                    let open = round.task.task_id;
                    self.state = ClientState::Assembling(round);
                    return Err(NodeError::BadArgs(format!(
                        "task {task_id} is not the advertised round (task {open})"
                    )));
                }
                if model_hash != round.task.model_ref {
                    tracing::warn!(
                        "train: modelHash differs from the on-chain modelRef for task {task_id}"
                    );
                }

                let candidates: Vec<PeerRecord> = self
                    .overlay
                    .mesh(&round.topic)
                    .into_iter()
                    .filter(|r| r.role == NodeRole::Trainer)
                    .collect();

                if let Err(e) = round.freeze(&candidates, session_pub_key.clone()) {
                    // NoTrainers: reject the transition, stay assembling.
                    self.state = ClientState::Assembling(round);
                    return Err(e);
                }

                let model_url = match self.store.presign_get(&model_hash, DEFAULT_PRESIGN_TTL).await
                {
                    Ok(url) => url,
                    Err(e) => {
                        tracing::warn!("model presign failed ({e}); using raw URL");
                        self.store.raw_url(&model_hash)
                    }
                };

                let assign = RoundMessage::Assign {
                    task_id,
                    model_url,
                    manifest_url,
                    session_pub_key,
                    assignments: round.assignments.clone(),
                };
                if let Err(e) = self.overlay.publish(&round.topic, assign.clone()).await {
                    // The re-emit timer covers a mesh that is still forming.
                    tracing::warn!("initial assignment publish: {e}");
                }

                let assignments_json = json!(round.assignments);
                let trainer_count = round.trainers.len();
                self.assign_message = Some(assign);
                self.assign_delay = ASSIGN_BACKOFF_BASE;
                self.next_assign_at = Some(tokio::time::Instant::now() + self.assign_delay);
                self.deadline_at = Some(tokio::time::Instant::now() + self.round_deadline);
                self.start_observer(task_id);

                self.log_round(
                    &format!(
                        "task {task_id}: assigned {} chunks to {trainer_count} trainers",
                        round.task.total_chunks
                    ),
                )
                .await;
                self.state = ClientState::Training(round);
                Ok(json!({ "state": "training", "assignments": assignments_json }))
            }
            other => {
                let name = other.name();
                self.state = other;
                Err(NodeError::Invariant(format!(
                    "train requires an advertised round (state: {name})"
                )))
            }
        }
    }

    fn status_json(&self) -> Value {
        let mut status = json!({
            "status": "running",
            "role": "client",
            "peerId": self.overlay.local_peer_id().to_base58(),
            "state": self.state.name(),
        });
        match &self.state {
            ClientState::Done { task_id, weights_urls } => {
                status["taskId"] = json!(task_id);
                status["weights"] = json!(weights_urls);
            }
            ClientState::Aborted { task_id, reason } => {
                status["taskId"] = json!(task_id);
                status["reason"] = json!(reason);
            }
            ClientState::Assembling(round) | ClientState::Training(round) => {
                status["taskId"] = json!(round.task.task_id);
                status["remaining"] = json!(round.remaining);
            }
            ClientState::Idle => {}
        }
        status
    }

    // ── Ledger observations ──────────────────────────────────────────────────

    async fn on_ledger_event(&mut self, event: TaskEvent) {
        let ClientState::Training(round) = &mut self.state else {
            return;
        };
        match event {
            TaskEvent::WeightsSubmitted { task_id, trainer, weights_hash, remaining, .. } => {
                let attribution = round.record_submission(&trainer, &weights_hash, remaining);
                tracing::info!(
                    "task {task_id}: weights {weights_hash} from {trainer} (remaining {remaining})"
                );

                if let Attribution::Chunk { chunk, trainer: peer } = attribution {
                    let ack = RoundMessage::SubmitAck {
                        task_id,
                        chunk,
                        trainer: peer.to_base58(),
                        weights_hash: weights_hash.clone(),
                    };
                    let topic = round.topic.clone();
                    if let Err(e) = self.overlay.publish(&topic, ack).await {
                        tracing::debug!("submit ack publish: {e}");
                    }
                }

                // Re-borrow: the publishes above needed `self`.
                let ClientState::Training(round) = &mut self.state else { return };
                if round.all_trainers_submitted() {
                    self.next_assign_at = None;
                }
                let ClientState::Training(round) = &self.state else { return };
                if round.is_complete() {
                    self.finish_round().await;
                }
            }
            TaskEvent::Completed { task_id } => {
                tracing::info!("task {task_id} completed on the ledger");
                self.finish_round().await;
            }
            TaskEvent::Created { .. } => {}
        }
    }

    /// Training → Settling → Done.
    async fn finish_round(&mut self) {
        let round = match std::mem::replace(&mut self.state, ClientState::Idle) {
            ClientState::Training(round) => round,
            other => {
                self.state = other;
                return;
            }
        };
        let task_id = round.task.task_id;

        self.clear_round_timers();
        self.stop_observer();

        let urls = self.resolve_weight_urls(&round.observed_hashes).await;
        if let Err(e) = self.overlay.unsubscribe(&round.topic).await {
            tracing::debug!("round topic unsubscribe: {e}");
        }
        self.log_round(&format!(
            "task {task_id} complete; {} weight files available",
            urls.len()
        ))
        .await;
        self.state = ClientState::Done { task_id, weights_urls: urls };
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    /// Re-publish the assignment until every trainer has submitted or the
    /// deadline fires; retransmissions are identical, so trainers treat them
    /// as no-ops.
    async fn re_emit_assign(&mut self) {
        let ClientState::Training(round) = &self.state else {
            self.next_assign_at = None;
            return;
        };
        let topic = round.topic.clone();
        let Some(assign) = self.assign_message.clone() else {
            self.next_assign_at = None;
            return;
        };

        tracing::debug!("re-emitting assignment on {topic}");
        if let Err(e) = self.overlay.publish(&topic, assign).await {
            tracing::debug!("assignment re-emit: {e}");
        }
        self.assign_delay = (self.assign_delay * 2).min(ASSIGN_BACKOFF_CAP);
        self.next_assign_at = Some(tokio::time::Instant::now() + self.assign_delay);
    }

    async fn on_deadline(&mut self) {
        self.deadline_at = None;
        match &self.state {
            ClientState::Training(round) => {
                let pending = round.unsubmitted();
                self.abort_round(format!(
                    "round deadline elapsed; chunks without submissions: {pending:?}"
                ))
                .await;
            }
            ClientState::Assembling(round) => {
                let task_id = round.task.task_id;
                self.abort_round(format!("task {task_id} never left assembly before the deadline"))
                    .await;
            }
            _ => {}
        }
    }

    async fn abort_round(&mut self, reason: String) {
        let state = std::mem::replace(&mut self.state, ClientState::Idle);
        let round = match state {
            ClientState::Training(r) | ClientState::Assembling(r) => r,
            other => {
                self.state = other;
                return;
            }
        };
        let task_id = round.task.task_id;
        tracing::error!("aborting round for task {task_id}: {reason}");

        self.clear_round_timers();
        self.stop_observer();
        if let Err(e) = self.overlay.unsubscribe(&round.topic).await {
            tracing::debug!("round topic unsubscribe: {e}");
        }
        self.log_round(&format!("round aborted: {reason}")).await;
        self.state = ClientState::Aborted { task_id, reason };
    }

    fn clear_round_timers(&mut self) {
        self.deadline_at = None;
        self.next_assign_at = None;
        self.assign_message = None;
        self.assign_delay = ASSIGN_BACKOFF_BASE;
    }

    // ── Overlay events ───────────────────────────────────────────────────────

    fn on_overlay_event(&mut self, event: OverlayEvent) {
        match event {
            OverlayEvent::Message { from, message: RoundMessage::Log { text }, .. } => {
                tracing::info!("[{from}] {text}");
            }
            OverlayEvent::PeerJoined { topic, peer } => {
                if self.is_round_topic(&topic) {
                    tracing::info!("candidate {peer} joined round topic {topic}");
                }
            }
            OverlayEvent::PeerLeft { topic, peer } => {
                if self.is_round_topic(&topic) {
                    tracing::info!("peer {peer} left round topic {topic}");
                }
            }
            _ => {}
        }
    }

    fn is_round_topic(&self, topic: &str) -> bool {
        match &self.state {
            ClientState::Assembling(r) | ClientState::Training(r) => r.topic == topic,
            _ => false,
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn start_observer(&mut self, task_id: u64) {
        self.stop_observer();
        let mut rx = self.ledger.spawn_observer(task_id);
        let tx = self.event_tx.clone();
        self.observer = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if tx.send(ClientEvent::Ledger(event)).await.is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_observer(&mut self) {
        if let Some(observer) = self.observer.take() {
            observer.abort();
        }
    }

    /// Weights hashes already accepted on-chain for `task_id`, in order.
    async fn submitted_hashes(&self, task_id: u64) -> Result<Vec<String>, NodeError> {
        let mut hashes = Vec::new();
        for event in self.ledger.fetch_task_events(task_id).await? {
            if let TaskEvent::WeightsSubmitted { weights_hash, .. } = event {
                if !hashes.contains(&weights_hash) {
                    hashes.push(weights_hash);
                }
            }
        }
        Ok(hashes)
    }

    /// Resolve each weights hash to a fresh signed URL; presign failures
    /// degrade to the raw bucket URL.
    async fn resolve_weight_urls(&self, hashes: &[String]) -> Vec<String> {
        let mut urls = Vec::with_capacity(hashes.len());
        for hash in hashes {
            match self.store.presign_get(hash, DEFAULT_PRESIGN_TTL).await {
                Ok(url) => urls.push(url),
                Err(e) => {
                    tracing::warn!("presign {hash} failed ({e}); using raw URL");
                    urls.push(self.store.raw_url(hash));
                }
            }
        }
        urls
    }

    /// Operator observability: overlay log line + consensus-topic append.
    async fn log_round(&self, text: &str) {
        if let Err(e) = self
            .overlay
            .publish(DISCOVERY_TOPIC, RoundMessage::Log { text: text.to_string() })
            .await
        {
            tracing::debug!("overlay log publish: {e}");
        }
        if let Err(e) = self.ledger.publish_log(text).await {
            tracing::debug!("consensus log append: {e}");
        }
    }
}

async fn sleep_until_opt(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
