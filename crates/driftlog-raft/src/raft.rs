//! The consensus runtime.
//!
//! A single task owns the [`RaftNode`], the FSM and the snapshot store and
//! drives them from four event sources: inbound peer messages, API
//! requests, the election deadline and the replication tick. Keeping the
//! node single-threaded makes the FSM contract trivial: commands apply in
//! commit order with no extra locking.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use driftlog_storage::LogConfig;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RaftConfig;
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::message::{Envelope, EntryKind, RaftMessage};
use crate::node::{Outbound, RaftNode, ServerInfo};
use crate::snapshot::{SnapshotMeta, SnapshotStore};
use crate::stable::StableStore;
use crate::store::RaftLogStore;
use crate::transport::{StreamLayer, Transport};

const API_DEPTH: usize = 256;
const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Api {
    Apply {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    Join {
        id: String,
        addr: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Servers {
        reply: oneshot::Sender<Vec<ServerInfo>>,
    },
    LeaderAddr {
        reply: oneshot::Sender<Option<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap handle onto the consensus runtime.
#[derive(Clone)]
pub struct Raft {
    api: mpsc::Sender<Api>,
    apply_timeout: Duration,
}

impl Raft {
    /// Open all consensus state under `data_dir/raft`, restore the FSM
    /// from the latest snapshot, and spawn the runtime. Returns the handle
    /// and the stream layer for the server's accept loop.
    pub fn start(
        data_dir: impl AsRef<Path>,
        config: RaftConfig,
        log_config: LogConfig,
        advertise_addr: String,
        mut fsm: Box<dyn Fsm>,
    ) -> Result<(Self, StreamLayer)> {
        config.validate()?;
        let raft_dir = data_dir.as_ref().join("raft");

        let log = RaftLogStore::open(raft_dir.join("log"), log_config)?;
        let stable = StableStore::open(raft_dir.join("stable"))?;
        let snapshots = SnapshotStore::open(raft_dir.join("snapshots"))?;

        let restored = match snapshots.latest()? {
            Some((meta, data)) => {
                info!(index = meta.index, term = meta.term, "restoring from snapshot");
                fsm.restore(Box::new(data))?;
                Some(meta)
            }
            None => None,
        };

        let mut node = RaftNode::new(advertise_addr.clone(), config.clone(), log, stable)?;
        node.recover(restored.as_ref())?;
        if config.bootstrap {
            node.bootstrap()?;
        }

        let (transport, stream_layer, delivery) =
            Transport::new(config.local_id.clone(), advertise_addr);
        let (api_tx, api_rx) = mpsc::channel(API_DEPTH);

        let runtime = Runtime {
            node,
            fsm,
            snapshots,
            transport,
            config: config.clone(),
            pending: HashMap::new(),
            applied_since_snapshot: 0,
            last_contact: HashMap::new(),
            last_leader_contact: None,
            was_leader: false,
        };
        tokio::spawn(runtime.run(delivery, api_rx));

        Ok((
            Self {
                api: api_tx,
                apply_timeout: config.apply_timeout,
            },
            stream_layer,
        ))
    }

    /// Submit a command; resolves with the FSM's response once committed
    /// and applied, bounded by the configured apply timeout.
    pub async fn apply(&self, data: Vec<u8>) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.api
            .send(Api::Apply { data, reply: tx })
            .await
            .map_err(|_| Error::Shutdown)?;
        match tokio::time::timeout(self.apply_timeout, rx).await {
            Err(_) => Err(Error::ApplyTimeout),
            Ok(Err(_)) => Err(Error::Shutdown),
            Ok(Ok(result)) => result,
        }
    }

    pub async fn join(&self, id: &str, addr: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.api
            .send(Api::Join {
                id: id.to_string(),
                addr: addr.to_string(),
                reply: tx,
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    pub async fn leave(&self, id: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.api
            .send(Api::Leave {
                id: id.to_string(),
                reply: tx,
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    pub async fn servers(&self) -> Result<Vec<ServerInfo>> {
        let (tx, rx) = oneshot::channel();
        self.api
            .send(Api::Servers { reply: tx })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    pub async fn leader_addr(&self) -> Result<Option<String>> {
        let (tx, rx) = oneshot::channel();
        self.api
            .send(Api::LeaderAddr { reply: tx })
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Poll until some node claims leadership or the timeout elapses.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(addr) = self.leader_addr().await? {
                return Ok(addr);
            }
            if Instant::now() >= deadline {
                return Err(Error::NoLeader);
            }
            tokio::time::sleep(LEADER_POLL_INTERVAL).await;
        }
    }

    /// Stop the runtime, flushing consensus storage.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.api.send(Api::Shutdown { reply: tx }).await.is_err() {
            return Ok(()); // already down
        }
        let _ = rx.await;
        Ok(())
    }
}

struct Runtime {
    node: RaftNode,
    fsm: Box<dyn Fsm>,
    snapshots: SnapshotStore,
    transport: Transport,
    config: RaftConfig,
    pending: HashMap<u64, oneshot::Sender<Result<Bytes>>>,
    applied_since_snapshot: u64,
    last_contact: HashMap<String, Instant>,
    last_leader_contact: Option<Instant>,
    was_leader: bool,
}

impl Runtime {
    async fn run(mut self, mut delivery: mpsc::Receiver<Envelope>, mut api: mpsc::Receiver<Api>) {
        let mut election_deadline = Instant::now() + self.node.random_election_timeout();
        let mut tick = tokio::time::interval(self.config.commit_timeout);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_envelope = delivery.recv() => {
                    let Some(envelope) = maybe_envelope else { break };
                    self.last_contact.insert(envelope.from_id.clone(), Instant::now());
                    match self.on_message(envelope).await {
                        Ok(reset) => {
                            if reset {
                                election_deadline =
                                    Instant::now() + self.node.random_election_timeout();
                            }
                        }
                        Err(e) => error!(error = %e, "failed handling peer message"),
                    }
                }
                maybe_api = api.recv() => {
                    let Some(request) = maybe_api else { break };
                    if let Api::Shutdown { reply } = request {
                        self.close();
                        let _ = reply.send(());
                        return;
                    }
                    if let Err(e) = self.on_api(request).await {
                        error!(error = %e, "failed handling api request");
                    }
                }
                _ = tokio::time::sleep_until(election_deadline) => {
                    if !self.node.is_leader() {
                        match self.node.start_election() {
                            Ok(out) => self.dispatch(out).await,
                            Err(e) => error!(error = %e, "failed to start election"),
                        }
                        if let Err(e) = self.after_event().await {
                            error!(error = %e, "post-election processing failed");
                        }
                    }
                    election_deadline = Instant::now() + self.node.random_election_timeout();
                }
                _ = tick.tick() => {
                    if let Err(e) = self.on_tick().await {
                        error!(error = %e, "replication tick failed");
                    }
                }
            }
        }
        self.close();
    }

    async fn on_message(&mut self, envelope: Envelope) -> Result<bool> {
        match &envelope.msg {
            RaftMessage::AppendEntries { .. } | RaftMessage::InstallSnapshot { .. } => {
                self.last_leader_contact = Some(Instant::now());
            }
            RaftMessage::RequestVote { .. } => {
                // Followers judge by recent heartbeats; a leader judges by
                // its own quorum lease.
                let fresh = if self.node.is_leader() {
                    self.lease_ok()
                } else {
                    self.last_leader_contact
                        .is_some_and(|t| t.elapsed() < self.config.heartbeat_timeout)
                };
                self.node.set_leader_fresh(fresh);
            }
            _ => {}
        }

        // InstallSnapshot needs the FSM, which the node does not own.
        if let RaftMessage::InstallSnapshot {
            term,
            leader_id,
            leader_addr,
            meta,
            data,
        } = envelope.msg
        {
            self.install_snapshot(term, leader_id, leader_addr, meta, data, envelope.from_addr)
                .await?;
            self.after_event().await?;
            return Ok(true);
        }

        let (out, reset) = self.node.handle(envelope)?;
        self.dispatch(out).await;
        self.after_event().await?;
        Ok(reset)
    }

    async fn install_snapshot(
        &mut self,
        term: u64,
        leader_id: String,
        leader_addr: String,
        meta: SnapshotMeta,
        data: Vec<u8>,
        reply_addr: String,
    ) -> Result<()> {
        if term < self.node.current_term() {
            self.transport
                .send(
                    &reply_addr,
                    RaftMessage::InstallSnapshotResponse {
                        term: self.node.current_term(),
                        last_index: 0,
                    },
                )
                .await;
            return Ok(());
        }

        info!(index = meta.index, from = %leader_id, "installing snapshot");
        self.fsm.restore(Box::new(Cursor::new(data.clone())))?;
        self.snapshots.create(&meta, Cursor::new(data))?;
        self.node.adopt_snapshot(&meta, (&leader_id, &leader_addr))?;
        self.applied_since_snapshot = 0;

        self.transport
            .send(
                &reply_addr,
                RaftMessage::InstallSnapshotResponse {
                    term: self.node.current_term(),
                    last_index: meta.index,
                },
            )
            .await;
        Ok(())
    }

    async fn on_api(&mut self, request: Api) -> Result<()> {
        match request {
            Api::Apply { data, reply } => {
                if !self.node.is_leader() {
                    let _ = reply.send(Err(Error::NotLeader {
                        leader_addr: self.node.leader_addr(),
                    }));
                    return Ok(());
                }
                match self.node.propose(EntryKind::Command, data) {
                    Ok(index) => {
                        self.pending.insert(index, reply);
                        let out = self.node.replicate_all()?;
                        self.dispatch(out).await;
                        // A single-voter cluster commits synchronously.
                        self.after_event().await?;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Api::Join { id, addr, reply } => {
                let result = match self.node.add_server(&id, &addr) {
                    Ok(out) => {
                        // Grace for the new peer: it has not had a chance
                        // to respond yet, so it must not count against the
                        // lease until the first tick reaches it.
                        self.last_contact.insert(id.clone(), Instant::now());
                        self.dispatch(out).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
                self.after_event().await?;
            }
            Api::Leave { id, reply } => {
                let result = match self.node.remove_server(&id) {
                    Ok(out) => {
                        self.dispatch(out).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
                self.after_event().await?;
            }
            Api::Servers { reply } => {
                let _ = reply.send(self.node.servers());
            }
            Api::LeaderAddr { reply } => {
                let _ = reply.send(self.node.leader_addr());
            }
            Api::Shutdown { .. } => unreachable!("handled in run()"),
        }
        Ok(())
    }

    async fn on_tick(&mut self) -> Result<()> {
        if !self.node.is_leader() {
            return Ok(());
        }
        if !self.lease_ok() {
            self.node.abdicate()?;
            self.fail_pending();
            return Ok(());
        }
        let out = self.node.replicate_all()?;
        self.dispatch(out).await;
        Ok(())
    }

    /// The leader must have heard from a quorum within the lease window.
    fn lease_ok(&self) -> bool {
        let members = self.node.members();
        if members.len() <= 1 {
            return true;
        }
        let now = Instant::now();
        let fresh = 1 + members
            .iter()
            .filter(|m| m.id != self.node.id)
            .filter(|m| {
                self.last_contact
                    .get(&m.id)
                    .is_some_and(|t| now.duration_since(*t) < self.config.leader_lease_timeout)
            })
            .count();
        fresh >= members.len() / 2 + 1
    }

    async fn dispatch(&mut self, out: Vec<Outbound>) {
        for action in out {
            match action {
                Outbound::Message { to_addr, msg } => {
                    self.transport.send(&to_addr, msg).await;
                }
                Outbound::NeedsSnapshot { to_id, to_addr } => {
                    match self.snapshots.latest_bytes() {
                        Ok(Some((meta, data))) => {
                            debug!(peer = %to_id, index = meta.index, "shipping snapshot");
                            self.transport
                                .send(
                                    &to_addr,
                                    RaftMessage::InstallSnapshot {
                                        term: self.node.current_term(),
                                        leader_id: self.node.id.clone(),
                                        leader_addr: self.node.addr.clone(),
                                        meta,
                                        data,
                                    },
                                )
                                .await;
                        }
                        Ok(None) => {
                            warn!(peer = %to_id, "peer needs a snapshot but none exists")
                        }
                        Err(e) => error!(error = %e, "failed to load snapshot for peer"),
                    }
                }
            }
        }
    }

    /// Apply newly committed entries, settle pending client replies, and
    /// take a snapshot when due.
    async fn after_event(&mut self) -> Result<()> {
        for entry in self.node.take_applicable()? {
            match entry.kind {
                EntryKind::Command => {
                    let result = self.fsm.apply(&entry.data);
                    self.applied_since_snapshot += 1;
                    match self.pending.remove(&entry.index) {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                error!(index = entry.index, error = %e, "fsm apply failed");
                            }
                        }
                    }
                }
                EntryKind::Noop | EntryKind::Configuration => {
                    if let Some(reply) = self.pending.remove(&entry.index) {
                        let _ = reply.send(Ok(Bytes::new()));
                    }
                }
            }
        }

        if !self.node.is_leader() {
            self.fail_pending();
        } else if !self.was_leader {
            // Freshly elected: start the lease clock from now for every
            // peer rather than judging them on pre-election silence.
            let now = Instant::now();
            for member in self.node.members() {
                self.last_contact.insert(member.id, now);
            }
        }
        self.was_leader = self.node.is_leader();
        self.maybe_snapshot()?;
        Ok(())
    }

    fn fail_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        debug!(count = self.pending.len(), "failing in-flight applies");
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(Error::LeadershipLost));
        }
    }

    fn maybe_snapshot(&mut self) -> Result<()> {
        if self.config.snapshot_threshold == 0
            || self.applied_since_snapshot < self.config.snapshot_threshold
        {
            return Ok(());
        }
        let index = self.node.last_applied();
        let meta = SnapshotMeta {
            term: self.node.term_at(index),
            index,
            members: self.node.members(),
        };
        info!(index, "taking snapshot");
        let reader = self.fsm.snapshot()?;
        self.snapshots.create(&meta, reader)?;
        self.node.snapshot_taken(&meta)?;
        self.applied_since_snapshot = 0;
        Ok(())
    }

    fn close(&mut self) {
        self.fail_pending();
        if let Err(e) = self.node.log().close() {
            error!(error = %e, "failed to close consensus log");
        }
        info!("raft runtime stopped");
    }
}
