//! High-level overlay node.
//!
//! Obtain an `OverlayHandle` before calling `run()` so role state machines
//! can send commands and subscribe to events while the swarm event-loop runs
//! inside a spawned task.
//!
//! The node owns the peer directory: a map of every peer it currently knows
//! about, with declared role and joined topics.  The directory is fed from
//! three sources — connection events (address), gossipsub subscription
//! events (topics of directly connected peers), and `AnnounceRole` messages
//! on the discovery topic (role + topics of any peer in the overlay, also
//! the freshness signal used for eviction).

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    net::Ipv4Addr,
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Instant,
};

use futures::StreamExt;
use libp2p::{
    gossipsub::{self, IdentTopic, PublishError},
    identify,
    swarm::{Swarm, SwarmEvent},
    Multiaddr, PeerId,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{interval_at, Duration, MissedTickBehavior},
};

use crate::{
    behaviour::{OverlayBehaviour, OverlayBehaviourEvent},
    error::OverlayError,
    protocol::{
        codec,
        types::{NodeRole, RoundMessage, DISCOVERY_TOPIC},
    },
    transport::{build_transport, load_or_create_keypair, swarm_config},
};

/// Alias used throughout this module.
type OverlaySwarm = Swarm<OverlayBehaviour>;

/// Dial backoff for the bootstrap link: base 1 s, doubling, capped at 30 s.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Per-attempt handshake budget when dialing the bootstrap at startup.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Startup dial attempts before the node gives up and exits (code 2).  Once
/// running, reconnect attempts are unbounded.
const BOOTSTRAP_DIAL_ATTEMPTS: u32 = 5;

// ── Public config / event / record types ──────────────────────────────────────

/// Configuration for an overlay node.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Role announced to the overlay; fixed for the node's lifetime.
    pub role: NodeRole,
    /// TCP listen port; `0` takes an OS-assigned port (client/trainer).
    pub listen_port: u16,
    /// Dialed at startup by client and trainer nodes; `None` for bootstrap.
    pub bootstrap_addr: Option<Multiaddr>,
    /// Path to persist the identity keypair.  `None` generates an ephemeral
    /// key (tests only — a stable PeerId is what chunk assignments name).
    pub keypair_path: Option<PathBuf>,
    /// Public address advertised to peers when running behind cloud NAT.
    pub external_ip: Option<Ipv4Addr>,
    /// Ledger account address announced with the role, so weight submissions
    /// observed on-chain can be attributed to this peer.
    pub account: Option<String>,
    /// Directory freshness window; silent peers are evicted after one
    /// heartbeat and every node re-announces at half this interval.
    pub heartbeat: Duration,
    /// Join every topic observed in the overlay.  Set on the bootstrap node:
    /// gossipsub only forwards messages for topics the forwarder is
    /// subscribed to, and with client and trainers all connected through the
    /// bootstrap, the rendezvous point must be a member of every round topic
    /// for their messages to flow.
    pub relay_all_topics: bool,
}

impl OverlayConfig {
    pub fn new(role: NodeRole) -> Self {
        Self {
            role,
            listen_port: 0,
            bootstrap_addr: None,
            keypair_path: None,
            external_ip: None,
            account: None,
            heartbeat: Duration::from_secs(10),
            relay_all_topics: false,
        }
    }
}

/// Directory entry for one known peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub role: NodeRole,
    pub topics: BTreeSet<String>,
    pub addr: Option<Multiaddr>,
    pub account: Option<String>,
    pub last_seen: Instant,
}

impl PeerRecord {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            role: NodeRole::Unknown,
            topics: BTreeSet::new(),
            addr: None,
            account: None,
            last_seen: Instant::now(),
        }
    }

    /// JSON view served by the `mesh` / `bootmesh` / `peers` commands.
    pub fn as_json(&self) -> serde_json::Value {
        serde_json::json!({
            "peerId": self.peer_id.to_base58(),
            "role": self.role.to_string(),
            "topics": self.topics.iter().collect::<Vec<_>>(),
            "addr": self.addr.as_ref().map(|a| a.to_string()),
            "account": self.account,
            "lastSeenSecs": self.last_seen.elapsed().as_secs(),
        })
    }
}

/// Events emitted by the overlay to the role state machines.
#[derive(Debug, Clone)]
pub enum OverlayEvent {
    /// A round-protocol message arrived on a subscribed topic.
    Message {
        topic: String,
        from: PeerId,
        message: RoundMessage,
    },
    /// A peer was observed joining a topic's mesh.
    PeerJoined { topic: String, peer: PeerId },
    /// A peer left a topic's mesh (unsubscribe, disconnect, or eviction).
    PeerLeft { topic: String, peer: PeerId },
    Connected { peer: PeerId },
    Disconnected { peer: PeerId },
}

#[derive(Debug)]
enum OverlayCommand {
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), OverlayError>>,
    },
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Result<(), OverlayError>>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<Result<(), OverlayError>>,
    },
    Publish {
        topic: String,
        message: RoundMessage,
        reply: oneshot::Sender<Result<(), OverlayError>>,
    },
    LocalAddrs {
        reply: oneshot::Sender<Vec<String>>,
    },
    Topics {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap-to-clone handle to the running `OverlayNode`.
#[derive(Clone, Debug)]
pub struct OverlayHandle {
    local_peer_id: PeerId,
    cmd_tx: mpsc::Sender<OverlayCommand>,
    event_tx: broadcast::Sender<OverlayEvent>,
    directory: Arc<RwLock<HashMap<PeerId, PeerRecord>>>,
}

impl OverlayHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Subscribe to overlay events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<OverlayEvent> {
        self.event_tx.subscribe()
    }

    /// Local view of `topic`'s mesh membership; eventually consistent with
    /// the overlay within one heartbeat.
    pub fn mesh(&self, topic: &str) -> Vec<PeerRecord> {
        let dir = self.directory.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<PeerRecord> = dir
            .values()
            .filter(|r| r.topics.contains(topic))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.peer_id.to_base58());
        out
    }

    /// All known peers, sorted by peer id.
    pub fn directory(&self) -> Vec<PeerRecord> {
        let dir = self.directory.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<PeerRecord> = dir.values().cloned().collect();
        out.sort_by_key(|r| r.peer_id.to_base58());
        out
    }

    pub async fn dial(&self, addr: Multiaddr) -> Result<(), OverlayError> {
        self.request(|reply| OverlayCommand::Dial { addr, reply }).await?
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), OverlayError> {
        let topic = topic.to_string();
        self.request(|reply| OverlayCommand::Subscribe { topic, reply }).await?
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), OverlayError> {
        let topic = topic.to_string();
        self.request(|reply| OverlayCommand::Unsubscribe { topic, reply }).await?
    }

    pub async fn publish(&self, topic: &str, message: RoundMessage) -> Result<(), OverlayError> {
        let topic = topic.to_string();
        self.request(|reply| OverlayCommand::Publish { topic, message, reply }).await?
    }

    pub async fn local_addrs(&self) -> Result<Vec<String>, OverlayError> {
        self.request(|reply| OverlayCommand::LocalAddrs { reply }).await
    }

    pub async fn topics(&self) -> Result<Vec<String>, OverlayError> {
        self.request(|reply| OverlayCommand::Topics { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(OverlayCommand::Shutdown).await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> OverlayCommand,
    ) -> Result<T, OverlayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| OverlayError::Shutdown)?;
        reply_rx.await.map_err(|_| OverlayError::Shutdown)
    }
}

// ── OverlayNode ───────────────────────────────────────────────────────────────

pub struct OverlayNode {
    config: OverlayConfig,
    key: libp2p::identity::Keypair,
    local_peer_id: PeerId,
    cmd_tx: mpsc::Sender<OverlayCommand>,
    cmd_rx: mpsc::Receiver<OverlayCommand>,
    event_tx: broadcast::Sender<OverlayEvent>,
    directory: Arc<RwLock<HashMap<PeerId, PeerRecord>>>,
}

impl OverlayNode {
    /// Load (or generate) the identity and prepare the node.  The `PeerId`
    /// is known from this point, before any socket is opened.
    pub fn new(config: OverlayConfig) -> Result<Self, OverlayError> {
        let key = match &config.keypair_path {
            Some(p) => load_or_create_keypair(p)?,
            None => libp2p::identity::Keypair::generate_ed25519(),
        };
        let local_peer_id = PeerId::from(key.public());
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, _) = broadcast::channel(256);
        Ok(Self {
            config,
            key,
            local_peer_id,
            cmd_tx,
            cmd_rx,
            event_tx,
            directory: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn handle(&self) -> OverlayHandle {
        OverlayHandle {
            local_peer_id: self.local_peer_id,
            cmd_tx: self.cmd_tx.clone(),
            event_tx: self.event_tx.clone(),
            directory: Arc::clone(&self.directory),
        }
    }

    /// Build the swarm, reach the bootstrap node, join the discovery topic,
    /// then run the event loop until shutdown.
    pub async fn run(self) -> Result<(), OverlayError> {
        let transport = build_transport(&self.key)?;
        let behaviour = OverlayBehaviour::new(&self.key)?;
        let mut swarm = Swarm::new(
            transport,
            behaviour,
            self.local_peer_id,
            swarm_config(self.config.heartbeat),
        );

        let listen: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", self.config.listen_port)
            .parse()
            .map_err(|e| OverlayError::Transport(format!("listen addr: {e}")))?;
        swarm
            .listen_on(listen)
            .map_err(|e| OverlayError::Transport(e.to_string()))?;

        if let Some(ip) = self.config.external_ip {
            // Cloud NAT: the socket binds 0.0.0.0 but peers must dial the
            // public address.  Only meaningful with a fixed port — an
            // OS-assigned port is unknown until after the bind.
            if self.config.listen_port != 0 {
                let external: Multiaddr = format!("/ip4/{ip}/tcp/{}", self.config.listen_port)
                    .parse()
                    .map_err(|e| OverlayError::Transport(format!("external addr: {e}")))?;
                swarm.add_external_address(external);
            }
        }

        tracing::info!(
            role = %self.config.role,
            "overlay starting peer_id={}",
            self.local_peer_id
        );

        let mut state = NodeState {
            local_peer_id: self.local_peer_id,
            role: self.config.role,
            account: self.config.account.clone(),
            heartbeat: self.config.heartbeat,
            relay_all_topics: self.config.relay_all_topics,
            event_tx: self.event_tx,
            directory: self.directory,
            topics: BTreeSet::new(),
            listen_addrs: Vec::new(),
            connected: HashSet::new(),
            bootstrap_peer: None,
            bootstrap_addr: self.config.bootstrap_addr.clone(),
            redial: None,
        };

        if let Some(addr) = self.config.bootstrap_addr.clone() {
            state.connect_bootstrap(&mut swarm, addr).await?;
        }

        state.subscribe(&mut swarm, DISCOVERY_TOPIC)?;
        state.event_loop(swarm, self.cmd_rx).await
    }
}

// ── NodeState ─────────────────────────────────────────────────────────────────

/// Pending bootstrap redial: dial `addr` at `when`, doubling `delay` on the
/// next failure.
struct Redial {
    addr: Multiaddr,
    delay: Duration,
    when: tokio::time::Instant,
}

/// All mutable state owned by the running event loop.  The swarm is a
/// separate local in `event_loop` so `tokio::select!` can poll it without
/// conflicting with the `&mut self` borrows of the handler methods.
struct NodeState {
    local_peer_id: PeerId,
    role: NodeRole,
    account: Option<String>,
    heartbeat: Duration,
    relay_all_topics: bool,
    event_tx: broadcast::Sender<OverlayEvent>,
    directory: Arc<RwLock<HashMap<PeerId, PeerRecord>>>,
    /// Topics this node is subscribed to.
    topics: BTreeSet<String>,
    listen_addrs: Vec<Multiaddr>,
    connected: HashSet<PeerId>,
    bootstrap_peer: Option<PeerId>,
    bootstrap_addr: Option<Multiaddr>,
    redial: Option<Redial>,
}

impl NodeState {
    // ── Startup: bootstrap link ──────────────────────────────────────────────

    /// Dial the bootstrap node with exponential backoff.  Bounded: a node
    /// that cannot reach its rendezvous point has nothing to do, so after
    /// `BOOTSTRAP_DIAL_ATTEMPTS` the error propagates and the process exits.
    async fn connect_bootstrap(
        &mut self,
        swarm: &mut OverlaySwarm,
        addr: Multiaddr,
    ) -> Result<(), OverlayError> {
        let mut delay = BACKOFF_BASE;
        let mut last_err = String::from("no dial attempted");

        for attempt in 1..=BOOTSTRAP_DIAL_ATTEMPTS {
            tracing::info!("dialing bootstrap {addr} (attempt {attempt})");
            if let Err(e) = swarm.dial(addr.clone()) {
                last_err = e.to_string();
            } else {
                let deadline = tokio::time::Instant::now() + DIAL_TIMEOUT;
                loop {
                    match tokio::time::timeout_at(deadline, swarm.select_next_some()).await {
                        Ok(event) => {
                            let mut established = false;
                            let mut failed = false;
                            match &event {
                                SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                                    self.bootstrap_peer = Some(*peer_id);
                                    established = true;
                                }
                                SwarmEvent::OutgoingConnectionError { error, .. } => {
                                    last_err = error.to_string();
                                    failed = true;
                                }
                                _ => {}
                            }
                            self.on_swarm_event(swarm, event);
                            if established {
                                return Ok(());
                            }
                            if failed {
                                break;
                            }
                        }
                        Err(_) => {
                            last_err = "handshake timed out".into();
                            break;
                        }
                    }
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(BACKOFF_CAP);
        }

        Err(OverlayError::BootstrapUnreachable(format!("{addr}: {last_err}")))
    }

    // ── Event loop ───────────────────────────────────────────────────────────

    async fn event_loop(
        mut self,
        mut swarm: OverlaySwarm,
        mut cmd_rx: mpsc::Receiver<OverlayCommand>,
    ) -> Result<(), OverlayError> {
        // Re-announce at half the heartbeat so remote directories refresh
        // strictly inside their eviction window.
        let announce_every = self.heartbeat / 2;
        let mut announce = interval_at(
            tokio::time::Instant::now() + announce_every,
            announce_every,
        );
        announce.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut sweep = interval_at(
            tokio::time::Instant::now() + self.heartbeat,
            self.heartbeat,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            // Copied out so the redial branch does not borrow `self` across
            // the handler arms.
            let redial_at = self.redial.as_ref().map(|r| r.when);

            tokio::select! {
                event = swarm.select_next_some() => {
                    self.on_swarm_event(&mut swarm, event);
                }
                _ = announce.tick() => {
                    self.announce(&mut swarm);
                }
                _ = sweep.tick() => {
                    self.evict_stale();
                }
                _ = sleep_until_opt(redial_at) => {
                    self.do_redial(&mut swarm);
                }
                Some(cmd) = cmd_rx.recv() => {
                    if self.on_command(&mut swarm, cmd) { break; }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        tracing::info!("overlay node shut down");
        Ok(())
    }

    // ── Swarm event dispatch ─────────────────────────────────────────────────

    fn on_swarm_event(&mut self, swarm: &mut OverlaySwarm, event: SwarmEvent<OverlayBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("listening on {address}");
                self.listen_addrs.push(address);
            }

            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                self.connected.insert(peer_id);
                if self.bootstrap_peer == Some(peer_id) {
                    self.redial = None;
                }
                let addr = endpoint.get_remote_address().clone();
                self.with_directory(|dir| {
                    let rec = dir.entry(peer_id).or_insert_with(|| PeerRecord::new(peer_id));
                    rec.addr = Some(addr);
                    rec.last_seen = Instant::now();
                });
                self.emit(OverlayEvent::Connected { peer: peer_id });
            }

            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                if num_established > 0 {
                    return;
                }
                self.connected.remove(&peer_id);
                self.remove_peer(peer_id);
                if self.bootstrap_peer == Some(peer_id) {
                    tracing::warn!("bootstrap link lost; scheduling reconnect");
                    self.schedule_redial(BACKOFF_BASE);
                }
            }

            SwarmEvent::Behaviour(OverlayBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                message,
                ..
            })) => {
                self.on_gossip_message(swarm, message);
            }

            SwarmEvent::Behaviour(OverlayBehaviourEvent::Gossipsub(
                gossipsub::Event::Subscribed { peer_id, topic },
            )) => {
                let topic = topic.as_str().to_string();
                self.relay_topic(swarm, &topic);
                self.set_topic_membership(peer_id, &topic, true);
            }

            SwarmEvent::Behaviour(OverlayBehaviourEvent::Gossipsub(
                gossipsub::Event::Unsubscribed { peer_id, topic },
            )) => {
                self.set_topic_membership(peer_id, topic.as_str(), false);
            }

            SwarmEvent::Behaviour(OverlayBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in info.listen_addrs {
                    swarm.add_peer_address(peer_id, addr);
                }
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                tracing::debug!("connection error to {peer_id:?}: {error}");
                if peer_id.is_some() && peer_id == self.bootstrap_peer {
                    // `do_redial` already doubled the stored delay; reuse it
                    // so the error path and the timeout path back off alike.
                    let delay = self
                        .redial
                        .as_ref()
                        .map(|r| r.delay)
                        .unwrap_or(BACKOFF_BASE);
                    self.schedule_redial(delay);
                }
            }

            _ => {}
        }
    }

    // ── Gossip message handling ──────────────────────────────────────────────

    fn on_gossip_message(&mut self, swarm: &mut OverlaySwarm, message: gossipsub::Message) {
        // Signed mode guarantees a source; unsigned messages never validate.
        let Some(from) = message.source else { return };
        let topic = message.topic.as_str().to_string();

        let decoded = match codec::decode(&message.data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("dropping undecodable message on {topic} from {from}: {e}");
                return;
            }
        };

        match decoded {
            RoundMessage::AnnounceRole { role, topics, account } => {
                if self.relay_all_topics {
                    for t in &topics {
                        self.relay_topic(swarm, t);
                    }
                }
                self.apply_announce(from, role, topics, account);
            }
            other => {
                // Any application message is also a liveness signal.
                self.with_directory(|dir| {
                    if let Some(rec) = dir.get_mut(&from) {
                        rec.last_seen = Instant::now();
                    }
                });
                self.emit(OverlayEvent::Message { topic, from, message: other });
            }
        }
    }

    /// Fold a role announcement into the directory, emitting join/leave
    /// events for the topic-set difference.
    fn apply_announce(
        &mut self,
        from: PeerId,
        role: NodeRole,
        topics: Vec<String>,
        account: Option<String>,
    ) {
        let new_topics: BTreeSet<String> = topics.into_iter().collect();
        let mut joined = Vec::new();
        let mut left = Vec::new();

        self.with_directory(|dir| {
            let rec = dir.entry(from).or_insert_with(|| PeerRecord::new(from));
            if rec.role != NodeRole::Unknown && rec.role != role {
                tracing::warn!("peer {from} changed role {} -> {role}", rec.role);
            }
            rec.role = role;
            if account.is_some() {
                rec.account = account.clone();
            }
            rec.last_seen = Instant::now();
            joined = new_topics.difference(&rec.topics).cloned().collect();
            left = rec.topics.difference(&new_topics).cloned().collect();
            rec.topics = new_topics.clone();
        });

        for topic in joined {
            self.emit(OverlayEvent::PeerJoined { topic, peer: from });
        }
        for topic in left {
            self.emit(OverlayEvent::PeerLeft { topic, peer: from });
        }
    }

    fn set_topic_membership(&mut self, peer: PeerId, topic: &str, member: bool) {
        let mut changed = false;
        self.with_directory(|dir| {
            let rec = dir.entry(peer).or_insert_with(|| PeerRecord::new(peer));
            rec.last_seen = Instant::now();
            changed = if member {
                rec.topics.insert(topic.to_string())
            } else {
                rec.topics.remove(topic)
            };
        });
        if changed {
            let event = if member {
                OverlayEvent::PeerJoined { topic: topic.to_string(), peer }
            } else {
                OverlayEvent::PeerLeft { topic: topic.to_string(), peer }
            };
            self.emit(event);
        }
    }

    /// Drop a peer from the directory, emitting leave events for every topic
    /// it was in.
    fn remove_peer(&mut self, peer: PeerId) {
        let mut topics = BTreeSet::new();
        self.with_directory(|dir| {
            if let Some(rec) = dir.remove(&peer) {
                topics = rec.topics;
            }
        });
        for topic in topics {
            self.emit(OverlayEvent::PeerLeft { topic, peer });
        }
        self.emit(OverlayEvent::Disconnected { peer });
    }

    /// Evict directory entries for peers that are not directly connected and
    /// have been silent for longer than one heartbeat.
    fn evict_stale(&mut self) {
        let stale: Vec<PeerId> = {
            let dir = self.directory.read().unwrap_or_else(|e| e.into_inner());
            dir.values()
                .filter(|r| !self.connected.contains(&r.peer_id))
                .filter(|r| r.last_seen.elapsed() > self.heartbeat)
                .map(|r| r.peer_id)
                .collect()
        };
        for peer in stale {
            tracing::debug!("evicting stale peer {peer}");
            self.remove_peer(peer);
        }
    }

    // ── Bootstrap redial ─────────────────────────────────────────────────────

    fn schedule_redial(&mut self, delay: Duration) {
        use rand::Rng;
        let Some(addr) = self.bootstrap_addr.clone() else { return };
        // Jitter keeps a fleet of trainers from stampeding a restarted
        // bootstrap in lockstep.
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        self.redial = Some(Redial {
            addr,
            delay,
            when: tokio::time::Instant::now() + delay + jitter,
        });
    }

    fn do_redial(&mut self, swarm: &mut OverlaySwarm) {
        let Some(redial) = self.redial.take() else { return };
        tracing::info!("re-dialing bootstrap {}", redial.addr);
        if let Err(e) = swarm.dial(redial.addr.clone()) {
            tracing::debug!("bootstrap redial failed: {e}");
        }
        // Keep a pending entry with the doubled delay so the next attempt
        // fires even when the failed handshake produces no error event.
        let next = (redial.delay * 2).min(BACKOFF_CAP);
        self.redial = Some(Redial {
            addr: redial.addr,
            delay: next,
            when: tokio::time::Instant::now() + next,
        });
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// Returns `true` when the loop should exit.
    fn on_command(&mut self, swarm: &mut OverlaySwarm, cmd: OverlayCommand) -> bool {
        match cmd {
            OverlayCommand::Dial { addr, reply } => {
                let result = swarm
                    .dial(addr)
                    .map_err(|e| OverlayError::Dial(e.to_string()));
                let _ = reply.send(result);
                false
            }
            OverlayCommand::Subscribe { topic, reply } => {
                let result = self.subscribe(swarm, &topic);
                if result.is_ok() {
                    // Push the new membership out immediately instead of
                    // waiting for the next announce tick.
                    self.announce(swarm);
                }
                let _ = reply.send(result);
                false
            }
            OverlayCommand::Unsubscribe { topic, reply } => {
                swarm
                    .behaviour_mut()
                    .gossipsub
                    .unsubscribe(&IdentTopic::new(&topic));
                self.topics.remove(&topic);
                self.announce(swarm);
                let _ = reply.send(Ok(()));
                false
            }
            OverlayCommand::Publish { topic, message, reply } => {
                let _ = reply.send(self.publish(swarm, &topic, &message));
                false
            }
            OverlayCommand::LocalAddrs { reply } => {
                let addrs = self
                    .listen_addrs
                    .iter()
                    .map(|a| format!("{a}/p2p/{}", self.local_peer_id))
                    .collect();
                let _ = reply.send(addrs);
                false
            }
            OverlayCommand::Topics { reply } => {
                let _ = reply.send(self.topics.iter().cloned().collect());
                false
            }
            OverlayCommand::Shutdown => true,
        }
    }

    /// Rendezvous relay: join a topic observed in the overlay so messages
    /// between peers that are only connected through this node keep flowing.
    fn relay_topic(&mut self, swarm: &mut OverlaySwarm, topic: &str) {
        if !self.relay_all_topics || self.topics.contains(topic) {
            return;
        }
        tracing::debug!("relaying topic {topic}");
        if let Err(e) = self.subscribe(swarm, topic) {
            tracing::warn!("relay subscribe {topic}: {e}");
        }
    }

    fn subscribe(&mut self, swarm: &mut OverlaySwarm, topic: &str) -> Result<(), OverlayError> {
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&IdentTopic::new(topic))
            .map_err(|e| OverlayError::Subscription(format!("{topic}: {e:?}")))?;
        self.topics.insert(topic.to_string());
        Ok(())
    }

    fn publish(
        &mut self,
        swarm: &mut OverlaySwarm,
        topic: &str,
        message: &RoundMessage,
    ) -> Result<(), OverlayError> {
        let data = codec::encode(message)?;
        match swarm
            .behaviour_mut()
            .gossipsub
            .publish(IdentTopic::new(topic), data)
        {
            Ok(_) => Ok(()),
            Err(PublishError::NoPeersSubscribedToTopic) => {
                Err(OverlayError::NoPeers(topic.to_string()))
            }
            Err(e) => Err(OverlayError::Publish(e.to_string())),
        }
    }

    /// Publish this node's role and topic memberships on the discovery topic.
    fn announce(&mut self, swarm: &mut OverlaySwarm) {
        let message = RoundMessage::AnnounceRole {
            role: self.role,
            topics: self.topics.iter().cloned().collect(),
            account: self.account.clone(),
        };
        if let Err(e) = self.publish(swarm, DISCOVERY_TOPIC, &message) {
            // Expected while the mesh is still forming.
            tracing::debug!("announce: {e}");
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn with_directory(&self, f: impl FnOnce(&mut HashMap<PeerId, PeerRecord>)) {
        let mut dir = self.directory.write().unwrap_or_else(|e| e.into_inner());
        f(&mut dir);
    }

    fn emit(&self, event: OverlayEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Sleep until `at`, or forever when no deadline is scheduled.
async fn sleep_until_opt(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
