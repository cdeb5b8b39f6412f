// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Trainer role: joins advertised rounds and works assigned chunks.
//!
//! Per round topic: `Idle → Joined → Working(chunk) → Submitted(chunk) →
//! Idle`.  A trainer may be joined to several round topics at once; each
//! round's chunks are processed sequentially by one spawned worker so the
//! control loop is never starved by downloads, training, or ledger calls.
//!
//! Assignment idempotence: a retransmitted `Assign` with identical contents
//! maps to the same idempotence key.  If the round's work succeeded it is a
//! no-op; if some chunks failed, the retransmission is the retry trigger.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use fedmesh_ledger::LedgerClient;
use fedmesh_p2p::{
    ChunkAssignment, OverlayEvent, OverlayHandle, PeerId, RoundMessage, DISCOVERY_TOPIC,
};
use fedmesh_store::{manifest, ObjectStore};

use crate::{
    command::{Command, CommandEnvelope},
    error::NodeError,
    executor,
    roles::{shared_command, shutdown_signal},
};

/// Everything the trainer loop can be woken by, on one queue.
#[derive(Debug)]
pub enum TrainerEvent {
    Command(CommandEnvelope),
    ChunkDone { topic: String, chunk: u32, weights_hash: String },
    ChunkFailed { topic: String, chunk: u32, reason: String },
    WorkerFinished { topic: String },
}

/// Progress of one joined round.
struct TrainerRound {
    task_id: u64,
    /// Idempotence key of the assignment being worked.
    assignment_key: String,
    my_chunks: Vec<u32>,
    done: HashSet<u32>,
    failed: HashMap<u32, String>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl TrainerRound {
    fn worker_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

pub struct TrainerNode {
    overlay: OverlayHandle,
    ledger: Arc<LedgerClient>,
    store: Arc<ObjectStore>,
    http: reqwest::Client,
    bootstrap_admin: Option<String>,
    event_tx: mpsc::Sender<TrainerEvent>,
    rounds: HashMap<String, TrainerRound>,
    /// Set on shutdown; workers finish the chunk in flight and stop.
    draining: Arc<AtomicBool>,
    scratch: tempfile::TempDir,
}

impl TrainerNode {
    pub fn new(
        overlay: OverlayHandle,
        ledger: Arc<LedgerClient>,
        store: Arc<ObjectStore>,
        bootstrap_admin: Option<String>,
    ) -> Result<(Self, mpsc::Receiver<TrainerEvent>), NodeError> {
        let (event_tx, event_rx) = mpsc::channel(128);
        let scratch = tempfile::tempdir()
            .map_err(|e| NodeError::Internal(format!("scratch dir: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| NodeError::Internal(e.to_string()))?;
        let node = Self {
            overlay,
            ledger,
            store,
            http,
            bootstrap_admin,
            event_tx,
            rounds: HashMap::new(),
            draining: Arc::new(AtomicBool::new(false)),
            scratch,
        };
        Ok((node, event_rx))
    }

    pub fn event_sender(&self) -> mpsc::Sender<TrainerEvent> {
        self.event_tx.clone()
    }

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<TrainerEvent>) -> Result<(), NodeError> {
        let mut overlay_events = self.overlay.subscribe_events();
        tracing::info!("trainer ready; peer_id={}", self.overlay.local_peer_id());

        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => match event {
                    TrainerEvent::Command(env) => {
                        let result = self.handle_command(env.command).await;
                        let _ = env.reply.send(result);
                    }
                    TrainerEvent::ChunkDone { topic, chunk, weights_hash } => {
                        self.on_chunk_done(&topic, chunk, weights_hash).await;
                    }
                    TrainerEvent::ChunkFailed { topic, chunk, reason } => {
                        tracing::warn!("chunk {chunk} of {topic} failed: {reason}");
                        if let Some(round) = self.rounds.get_mut(&topic) {
                            round.failed.insert(chunk, reason);
                        }
                    }
                    TrainerEvent::WorkerFinished { topic } => {
                        if let Some(round) = self.rounds.get_mut(&topic) {
                            round.worker = None;
                        }
                    }
                },
                event = overlay_events.recv() => match event {
                    Ok(OverlayEvent::Message { topic, from, message }) => {
                        self.on_message(topic, from, message);
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("overlay event stream lagged by {n}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown_signal() => {
                    self.drain().await;
                    break;
                }
            }
        }
        Ok(())
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> Result<Value, NodeError> {
        match &cmd {
            // Leaving a round also stops its worker.
            Command::Leave { topic } => {
                if let Some(round) = self.rounds.remove(topic) {
                    if let Some(worker) = round.worker {
                        worker.abort();
                    }
                    tracing::info!("left round {topic} with {} chunks done", round.done.len());
                }
            }
            _ => {}
        }
        if let Some(result) =
            shared_command(&self.overlay, &self.http, self.bootstrap_admin.as_deref(), &cmd).await
        {
            return result;
        }
        match cmd {
            Command::Status => Ok(self.status_json()),
            other => Err(NodeError::UnknownCommand(format!("{other:?} (trainer role)"))),
        }
    }

    fn status_json(&self) -> Value {
        let rounds: Vec<Value> = self
            .rounds
            .iter()
            .map(|(topic, r)| {
                json!({
                    "topic": topic,
                    "taskId": r.task_id,
                    "assigned": r.my_chunks,
                    "done": r.done.iter().collect::<Vec<_>>(),
                    "failed": r.failed.keys().collect::<Vec<_>>(),
                    "working": r.worker_running(),
                })
            })
            .collect();
        json!({
            "status": "running",
            "role": "trainer",
            "peerId": self.overlay.local_peer_id().to_base58(),
            "rounds": rounds,
        })
    }

    // ── Round messages ───────────────────────────────────────────────────────

    fn on_message(&mut self, topic: String, from: PeerId, message: RoundMessage) {
        let key = message.idempotence_key(&from.to_base58()).unwrap_or_default();
        match message {
            RoundMessage::Assign {
                task_id,
                model_url,
                manifest_url,
                session_pub_key: _,
                assignments,
            } => {
                self.on_assign(topic, task_id, model_url, manifest_url, assignments, key);
            }
            RoundMessage::SubmitAck { task_id, chunk, trainer, .. } => {
                if trainer == self.overlay.local_peer_id().to_base58() {
                    tracing::info!("client acknowledged chunk {chunk} of task {task_id}");
                }
            }
            RoundMessage::Log { text } => {
                tracing::info!("[{from}] {text}");
            }
            RoundMessage::Advertise { task_id } => {
                tracing::info!("task {task_id} advertised; join with: join {task_id}");
            }
            RoundMessage::AnnounceRole { .. } => {}
        }
    }

    /// Handle an assignment message for a joined round topic.
    fn on_assign(
        &mut self,
        topic: String,
        task_id: u64,
        model_url: String,
        manifest_url: String,
        assignments: Vec<ChunkAssignment>,
        key: String,
    ) {
        // Assignments are only valid on their own round topic (topic name =
        // task id); anything else is dropped.
        if topic != task_id.to_string() {
            tracing::warn!("dropping assignment for task {task_id} seen on topic {topic}");
            return;
        }
        // A chunk assigned twice is a protocol violation; drop the message.
        let mut chunk_set = HashSet::new();
        if !assignments.iter().all(|a| chunk_set.insert(a.chunk)) {
            tracing::warn!("dropping assignment for task {task_id}: duplicate chunk index");
            return;
        }

        let me = self.overlay.local_peer_id().to_base58();
        let mut my_chunks: Vec<u32> = assignments
            .iter()
            .filter(|a| a.trainer == me)
            .map(|a| a.chunk)
            .collect();
        my_chunks.sort_unstable();

        if let Some(round) = self.rounds.get_mut(&topic) {
            if round.assignment_key == key {
                if round.worker_running() {
                    return;
                }
                if round.failed.is_empty() {
                    // Identical retransmission of completed work: no-op.
                    return;
                }
                // Retransmission while some chunks failed: retry those.
                let retry: Vec<u32> = round.failed.keys().copied().collect();
                round.failed.clear();
                tracing::info!("retrying {} failed chunks of task {task_id}", retry.len());
                let worker = self.spawn_worker(&topic, task_id, &model_url, &manifest_url, retry);
                if let Some(round) = self.rounds.get_mut(&topic) {
                    round.worker = Some(worker);
                }
                return;
            }
            tracing::warn!("task {task_id}: assignment changed; restarting work");
            if let Some(worker) = round.worker.take() {
                worker.abort();
            }
        }

        if my_chunks.is_empty() {
            tracing::info!("task {task_id}: no chunks assigned to this trainer");
            return;
        }
        tracing::info!("task {task_id}: assigned chunks {my_chunks:?}");

        let worker =
            self.spawn_worker(&topic, task_id, &model_url, &manifest_url, my_chunks.clone());
        self.rounds.insert(
            topic,
            TrainerRound {
                task_id,
                assignment_key: key,
                my_chunks,
                done: HashSet::new(),
                failed: HashMap::new(),
                worker: Some(worker),
            },
        );
    }

    async fn on_chunk_done(&mut self, topic: &str, chunk: u32, weights_hash: String) {
        let Some(round) = self.rounds.get_mut(topic) else { return };
        round.done.insert(chunk);
        let task_id = round.task_id;
        let finished = round.done.len() == round.my_chunks.len();

        let text = format!("trainer submitted weights {weights_hash} for chunk {chunk} of task {task_id}");
        if let Err(e) = self
            .overlay
            .publish(DISCOVERY_TOPIC, RoundMessage::Log { text: text.clone() })
            .await
        {
            tracing::debug!("log publish: {e}");
        }
        if let Err(e) = self.ledger.publish_log(&text).await {
            tracing::debug!("consensus log append: {e}");
        }

        if finished {
            // Submitted → Idle for this topic; the discovery topic stays.
            tracing::info!("all assigned chunks of task {task_id} submitted");
            if let Err(e) = self.overlay.unsubscribe(topic).await {
                tracing::debug!("round topic unsubscribe: {e}");
            }
            self.rounds.remove(topic);
        }
    }

    // ── Worker ───────────────────────────────────────────────────────────────

    fn spawn_worker(
        &self,
        topic: &str,
        task_id: u64,
        model_url: &str,
        manifest_url: &str,
        chunks: Vec<u32>,
    ) -> tokio::task::JoinHandle<()> {
        let ctx = WorkerCtx {
            http: self.http.clone(),
            store: Arc::clone(&self.store),
            ledger: Arc::clone(&self.ledger),
            events: self.event_tx.clone(),
            scratch: self.scratch.path().to_path_buf(),
            draining: Arc::clone(&self.draining),
        };
        let topic = topic.to_string();
        let model_url = model_url.to_string();
        let manifest_url = manifest_url.to_string();
        tokio::spawn(run_chunks(ctx, topic, task_id, model_url, manifest_url, chunks))
    }

    /// Graceful drain: let workers finish the chunk in flight (the ledger
    /// submission must complete to preserve the payout), then leave.
    async fn drain(&mut self) {
        tracing::info!("draining: waiting for in-flight submissions");
        self.draining.store(true, Ordering::SeqCst);
        for (topic, round) in self.rounds.drain() {
            if let Some(worker) = round.worker {
                if let Err(e) = worker.await {
                    tracing::debug!("worker for {topic} ended: {e}");
                }
            }
        }
        self.overlay.shutdown().await;
    }
}

struct WorkerCtx {
    http: reqwest::Client,
    store: Arc<ObjectStore>,
    ledger: Arc<LedgerClient>,
    events: mpsc::Sender<TrainerEvent>,
    scratch: PathBuf,
    draining: Arc<AtomicBool>,
}

/// Sequentially process the given chunks: fetch chunk + model, run the model
/// artifact, upload the weights, submit the hash on-chain.
async fn run_chunks(
    ctx: WorkerCtx,
    topic: String,
    task_id: u64,
    model_url: String,
    manifest_url: String,
    chunks: Vec<u32>,
) {
    let outcome = async {
        let manifest_body = download_text(&ctx.http, &manifest_url).await?;
        let chunk_urls = manifest::parse(&manifest_body);
        let model = download_bytes(&ctx.http, &model_url).await?;
        Ok::<_, NodeError>((chunk_urls, model))
    }
    .await;

    let (chunk_urls, model) = match outcome {
        Ok(v) => v,
        Err(e) => {
            // Without the manifest or model nothing can proceed.
            for chunk in &chunks {
                let _ = ctx
                    .events
                    .send(TrainerEvent::ChunkFailed {
                        topic: topic.clone(),
                        chunk: *chunk,
                        reason: e.to_string(),
                    })
                    .await;
            }
            let _ = ctx.events.send(TrainerEvent::WorkerFinished { topic }).await;
            return;
        }
    };

    for chunk in chunks {
        if ctx.draining.load(Ordering::SeqCst) {
            tracing::info!("drain requested; stopping before chunk {chunk}");
            break;
        }
        let result = work_one_chunk(&ctx, task_id, chunk, &chunk_urls, &model).await;
        let event = match result {
            Ok(weights_hash) => TrainerEvent::ChunkDone {
                topic: topic.clone(),
                chunk,
                weights_hash,
            },
            Err(e) => TrainerEvent::ChunkFailed {
                topic: topic.clone(),
                chunk,
                reason: e.to_string(),
            },
        };
        if ctx.events.send(event).await.is_err() {
            return;
        }
    }
    let _ = ctx.events.send(TrainerEvent::WorkerFinished { topic }).await;
}

async fn work_one_chunk(
    ctx: &WorkerCtx,
    task_id: u64,
    chunk: u32,
    chunk_urls: &[String],
    model: &[u8],
) -> Result<String, NodeError> {
    let url = chunk_urls.get(chunk as usize).ok_or_else(|| {
        NodeError::Invariant(format!(
            "manifest has {} entries but chunk {chunk} was assigned",
            chunk_urls.len()
        ))
    })?;

    tracing::info!("task {task_id}: training on chunk {chunk}");
    let data = download_bytes(&ctx.http, url).await?;

    let tag = format!("task{task_id}-chunk{chunk}");
    let weights = executor::run_model(
        &ctx.scratch,
        &tag,
        model,
        &data,
        executor::DEFAULT_TRAIN_TIMEOUT,
    )
    .await?;

    let weights_hash = ctx.store.upload(weights).await?;
    ctx.ledger.submit_weights(task_id, &weights_hash).await?;
    tracing::info!("task {task_id}: chunk {chunk} submitted as {weights_hash}");
    Ok(weights_hash)
}

async fn download_bytes(http: &reqwest::Client, url: &str) -> Result<Vec<u8>, NodeError> {
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|e| NodeError::Internal(format!("download: {e}")))?;
    if !resp.status().is_success() {
        return Err(NodeError::Internal(format!("download: HTTP {}", resp.status())));
    }
    Ok(resp
        .bytes()
        .await
        .map_err(|e| NodeError::Internal(format!("download: {e}")))?
        .to_vec())
}

async fn download_text(http: &reqwest::Client, url: &str) -> Result<String, NodeError> {
    let bytes = download_bytes(http, url).await?;
    String::from_utf8(bytes).map_err(|e| NodeError::Internal(format!("manifest: {e}")))
}
