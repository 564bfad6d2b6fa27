//! The Raft state machine: elections, log replication, commitment.
//!
//! This type is deterministic and does no networking of its own. Every
//! handler consumes a message (or a timer firing) and returns the messages
//! to send; the runtime in [`crate::raft`] owns the sockets and clocks.
//! Persistence happens inline through the log, stable and (via the
//! runtime) snapshot stores.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::RaftConfig;
use crate::error::{Error, Result};
use crate::message::{Envelope, EntryKind, LogEntry, RaftMessage, ServerConfig};
use crate::snapshot::SnapshotMeta;
use crate::stable::{PersistedState, StableStore};
use crate::store::RaftLogStore;

/// Cap on entries shipped per AppendEntries.
const MAX_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
}

/// A cluster member annotated with live leadership, as reported to
/// clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: String,
    pub rpc_addr: String,
    pub is_leader: bool,
}

/// What the runtime should do with a peer after a handler ran.
#[derive(Debug)]
pub enum Outbound {
    Message { to_addr: String, msg: RaftMessage },
    /// The peer is too far behind the log; ship it the latest snapshot.
    NeedsSnapshot { to_id: String, to_addr: String },
}

pub struct RaftNode {
    pub id: String,
    pub addr: String,
    config: RaftConfig,

    state: NodeState,
    current_term: u64,
    voted_for: Option<String>,
    leader: Option<(String, String)>,

    log: RaftLogStore,
    stable: StableStore,

    commit_index: u64,
    last_applied: u64,

    // Boundary left behind by the latest snapshot.
    snapshot_last_index: u64,
    snapshot_last_term: u64,

    servers: Vec<ServerConfig>,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    votes: HashSet<String>,

    /// Set by the runtime before vote handling: the node heard from a live
    /// leader within the heartbeat window. A fresh leader makes us refuse
    /// votes so a partitioned or removed server cannot disrupt the
    /// cluster with term inflation.
    leader_fresh: bool,
}

impl RaftNode {
    pub fn new(
        addr: String,
        config: RaftConfig,
        log: RaftLogStore,
        stable: StableStore,
    ) -> Result<Self> {
        config.validate()?;
        let persisted = stable.load()?;

        Ok(Self {
            id: config.local_id.clone(),
            addr,
            config,
            state: NodeState::Follower,
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            leader: None,
            log,
            stable,
            commit_index: 0,
            last_applied: 0,
            snapshot_last_index: 0,
            snapshot_last_term: 0,
            servers: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: HashSet::new(),
            leader_fresh: false,
        })
    }

    /// Runtime hook: whether leader contact is within the heartbeat
    /// window. Consulted when a vote request arrives.
    pub fn set_leader_fresh(&mut self, fresh: bool) {
        self.leader_fresh = fresh;
    }

    // -- accessors ----------------------------------------------------

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn snapshot_last_index(&self) -> u64 {
        self.snapshot_last_index
    }

    pub fn log(&self) -> &RaftLogStore {
        &self.log
    }

    /// Address of the current leader, when known.
    pub fn leader_addr(&self) -> Option<String> {
        if self.is_leader() {
            Some(self.addr.clone())
        } else {
            self.leader.as_ref().map(|(_, addr)| addr.clone())
        }
    }

    /// The consensus configuration annotated with leadership.
    pub fn servers(&self) -> Vec<ServerInfo> {
        let leader_addr = self.leader_addr();
        self.servers
            .iter()
            .map(|s| ServerInfo {
                id: s.id.clone(),
                rpc_addr: s.addr.clone(),
                is_leader: leader_addr.as_deref() == Some(s.addr.as_str()),
            })
            .collect()
    }

    /// The raw membership list, as recorded in configuration entries.
    pub fn members(&self) -> Vec<ServerConfig> {
        self.servers.clone()
    }

    fn peers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.iter().filter(move |s| s.id != self.id)
    }

    fn quorum(&self) -> usize {
        self.servers.len() / 2 + 1
    }

    fn is_voter(&self) -> bool {
        self.servers.iter().any(|s| s.id == self.id)
    }

    /// A randomized election deadline offset from now. Followers time out
    /// on lost leader contact (`heartbeat_timeout`); candidates re-arm on
    /// a split vote (`election_timeout`). Both get jitter in `[base, 2*base)`.
    pub fn random_election_timeout(&self) -> std::time::Duration {
        let base = match self.state {
            NodeState::Candidate => self.config.election_timeout,
            _ => self.config.heartbeat_timeout,
        }
        .as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..base.max(1));
        std::time::Duration::from_millis(base + jitter)
    }

    // -- startup ------------------------------------------------------

    /// Restore volatile indices and membership from a snapshot taken by a
    /// previous run, then re-learn any configuration entries appended
    /// after it.
    pub fn recover(&mut self, snapshot: Option<&SnapshotMeta>) -> Result<()> {
        if let Some(meta) = snapshot {
            self.snapshot_last_index = meta.index;
            self.snapshot_last_term = meta.term;
            self.commit_index = meta.index;
            self.last_applied = meta.index;
            self.servers = meta.members.clone();
        }
        self.rescan_configuration()?;
        Ok(())
    }

    /// Bootstrap a single-node cluster: the local server becomes the sole
    /// voter via a configuration entry at index 1. Only valid when no
    /// prior state exists.
    pub fn bootstrap(&mut self) -> Result<()> {
        if !self.log.is_empty() || !self.stable.is_fresh() || self.snapshot_last_index != 0 {
            debug!("prior state exists, skipping bootstrap");
            return Ok(());
        }
        self.current_term = 1;
        self.persist()?;

        let members = vec![ServerConfig {
            id: self.id.clone(),
            addr: self.addr.clone(),
        }];
        let entry = LogEntry::new(1, 1, EntryKind::Configuration, encode_members(&members)?);
        self.log.append(&[entry])?;
        self.servers = members;
        info!(id = %self.id, "bootstrapped single-node cluster");
        Ok(())
    }

    fn rescan_configuration(&mut self) -> Result<()> {
        let first = self.log.first_index();
        let last = self.log.last_index();
        let mut index = first;
        while index <= last && last > 0 {
            let entry = self.log.entry(index)?;
            if entry.kind == EntryKind::Configuration {
                self.servers = decode_members(&entry.data)?;
            }
            index += 1;
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        self.stable.save(&PersistedState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        })
    }

    pub(crate) fn term_at(&self, index: u64) -> u64 {
        if index == 0 {
            0
        } else if index == self.snapshot_last_index {
            self.snapshot_last_term
        } else {
            self.log.term_at(index)
        }
    }

    // -- elections ----------------------------------------------------

    /// The election timer fired: become a candidate and solicit votes.
    /// Non-voters stay passive.
    pub fn start_election(&mut self) -> Result<Vec<Outbound>> {
        if !self.is_voter() {
            return Ok(Vec::new());
        }
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.persist()?;
        self.votes = HashSet::from([self.id.clone()]);
        self.leader = None;
        debug!(term = self.current_term, "election started");

        let msg = RaftMessage::RequestVote {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index().max(self.snapshot_last_index),
            last_log_term: self.term_at(self.log.last_index().max(self.snapshot_last_index)),
        };

        let mut out: Vec<Outbound> = self
            .peers()
            .map(|p| Outbound::Message {
                to_addr: p.addr.clone(),
                msg: msg.clone(),
            })
            .collect();

        // A single-voter cluster wins instantly.
        if self.votes.len() >= self.quorum() {
            out.extend(self.become_leader()?);
        }
        Ok(out)
    }

    fn become_leader(&mut self) -> Result<Vec<Outbound>> {
        self.state = NodeState::Leader;
        self.leader = Some((self.id.clone(), self.addr.clone()));
        self.votes.clear();
        let last = self.log.last_index().max(self.snapshot_last_index);
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.servers.clone() {
            if peer.id != self.id {
                self.next_index.insert(peer.id.clone(), last + 1);
                self.match_index.insert(peer.id, 0);
            }
        }
        info!(term = self.current_term, id = %self.id, "became leader");

        // A no-op lets this term's leader commit entries left over from
        // earlier terms.
        self.propose(EntryKind::Noop, Vec::new())?;
        self.replicate_all()
    }

    fn step_down(&mut self, term: u64) -> Result<()> {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.persist()?;
        }
        if self.state != NodeState::Follower {
            debug!(term = self.current_term, "stepping down to follower");
        }
        self.state = NodeState::Follower;
        self.votes.clear();
        Ok(())
    }

    /// Called by the runtime's lease check: the leader has lost contact
    /// with a quorum.
    pub fn abdicate(&mut self) -> Result<()> {
        warn!(term = self.current_term, "leader lease expired without quorum contact");
        self.leader = None;
        self.step_down(self.current_term)
    }

    // -- client proposals ---------------------------------------------

    /// Append a new entry to the leader's log. Returns its index.
    pub fn propose(&mut self, kind: EntryKind, data: Vec<u8>) -> Result<u64> {
        if self.state != NodeState::Leader {
            return Err(Error::NotLeader {
                leader_addr: self.leader_addr(),
            });
        }
        let index = self.log.last_index().max(self.snapshot_last_index) + 1;
        let entry = LogEntry::new(index, self.current_term, kind, data);
        self.log.append(std::slice::from_ref(&entry))?;
        if entry.kind == EntryKind::Configuration {
            self.apply_configuration(&entry)?;
        }
        // Our own log counts toward the quorum immediately.
        self.try_advance_commit();
        Ok(index)
    }

    /// Replication messages for every peer.
    pub fn replicate_all(&mut self) -> Result<Vec<Outbound>> {
        if self.state != NodeState::Leader {
            return Ok(Vec::new());
        }
        let peers: Vec<ServerConfig> = self.peers().cloned().collect();
        let mut out = Vec::with_capacity(peers.len());
        for peer in peers {
            out.push(self.replication_for(&peer)?);
        }
        Ok(out)
    }

    fn replication_for(&self, peer: &ServerConfig) -> Result<Outbound> {
        let next = *self.next_index.get(&peer.id).unwrap_or(&1);

        // The peer needs entries we no longer hold: ship a snapshot.
        if next <= self.snapshot_last_index || next < self.log.first_index() {
            return Ok(Outbound::NeedsSnapshot {
                to_id: peer.id.clone(),
                to_addr: peer.addr.clone(),
            });
        }

        let last = self.log.last_index();
        let entries = if next <= last {
            self.log.entries(next, last, MAX_BATCH)?
        } else {
            Vec::new()
        };

        Ok(Outbound::Message {
            to_addr: peer.addr.clone(),
            msg: RaftMessage::AppendEntries {
                term: self.current_term,
                leader_id: self.id.clone(),
                leader_addr: self.addr.clone(),
                prev_log_index: next - 1,
                prev_log_term: self.term_at(next - 1),
                entries,
                leader_commit: self.commit_index,
            },
        })
    }

    // -- message handling ---------------------------------------------

    /// Dispatch one inbound message. The second return value is whether
    /// the election timer should reset.
    pub fn handle(&mut self, envelope: Envelope) -> Result<(Vec<Outbound>, bool)> {
        let Envelope {
            from_id,
            from_addr,
            msg,
        } = envelope;
        match msg {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                let (resp, reset) =
                    self.handle_request_vote(term, &candidate_id, last_log_index, last_log_term)?;
                Ok((
                    vec![Outbound::Message {
                        to_addr: from_addr,
                        msg: resp,
                    }],
                    reset,
                ))
            }
            RaftMessage::RequestVoteResponse { term, vote_granted } => {
                let out = self.handle_vote_response(term, vote_granted, &from_id)?;
                Ok((out, false))
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                leader_addr,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let (resp, reset) = self.handle_append_entries(
                    term,
                    &leader_id,
                    &leader_addr,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                )?;
                Ok((
                    vec![Outbound::Message {
                        to_addr: from_addr,
                        msg: resp,
                    }],
                    reset,
                ))
            }
            RaftMessage::AppendEntriesResponse {
                term,
                success,
                match_index,
            } => {
                let out = self.handle_append_response(term, success, match_index, &from_id)?;
                Ok((out, false))
            }
            RaftMessage::InstallSnapshotResponse { term, last_index } => {
                if term > self.current_term {
                    self.step_down(term)?;
                    return Ok((Vec::new(), false));
                }
                let out = self.snapshot_installed(&from_id, last_index)?;
                Ok((out, false))
            }
            // InstallSnapshot itself is handled by the runtime, which owns
            // the FSM; it never reaches here.
            RaftMessage::InstallSnapshot { .. } => Ok((Vec::new(), false)),
        }
    }

    fn handle_request_vote(
        &mut self,
        term: u64,
        candidate_id: &str,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Result<(RaftMessage, bool)> {
        // A live leader wins over any challenger: refuse without adopting
        // the candidate's term.
        if self.leader_fresh
            && self.leader.as_ref().map(|(id, _)| id.as_str()) != Some(candidate_id)
        {
            return Ok((
                RaftMessage::RequestVoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                },
                false,
            ));
        }
        if term < self.current_term {
            return Ok((
                RaftMessage::RequestVoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                },
                false,
            ));
        }
        if term > self.current_term {
            self.step_down(term)?;
        }

        let can_vote =
            self.voted_for.is_none() || self.voted_for.as_deref() == Some(candidate_id);
        let log_ok = self.candidate_log_up_to_date(last_log_index, last_log_term);
        let vote_granted = can_vote && log_ok;

        if vote_granted {
            self.voted_for = Some(candidate_id.to_string());
            self.persist()?;
        }
        Ok((
            RaftMessage::RequestVoteResponse {
                term: self.current_term,
                vote_granted,
            },
            vote_granted,
        ))
    }

    /// Raft §5.4.1: the candidate's log must be at least as up to date.
    fn candidate_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_index = self.log.last_index().max(self.snapshot_last_index);
        let our_term = self.term_at(our_index);
        if last_log_term != our_term {
            last_log_term > our_term
        } else {
            last_log_index >= our_index
        }
    }

    fn handle_vote_response(
        &mut self,
        term: u64,
        vote_granted: bool,
        from: &str,
    ) -> Result<Vec<Outbound>> {
        if term > self.current_term {
            self.step_down(term)?;
            return Ok(Vec::new());
        }
        if self.state != NodeState::Candidate || term != self.current_term {
            return Ok(Vec::new());
        }
        if vote_granted {
            self.votes.insert(from.to_string());
            if self.votes.len() >= self.quorum() {
                return self.become_leader();
            }
        }
        Ok(Vec::new())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append_entries(
        &mut self,
        term: u64,
        leader_id: &str,
        leader_addr: &str,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Result<(RaftMessage, bool)> {
        if term < self.current_term {
            return Ok((
                RaftMessage::AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    match_index: 0,
                },
                false,
            ));
        }

        self.step_down(term)?;
        self.leader = Some((leader_id.to_string(), leader_addr.to_string()));

        // Consistency check: our log must contain prev_log_index at
        // prev_log_term.
        let consistent = prev_log_index == 0
            || (prev_log_index <= self.log.last_index().max(self.snapshot_last_index)
                && self.term_at(prev_log_index) == prev_log_term);
        if !consistent {
            return Ok((
                RaftMessage::AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    match_index: 0,
                },
                true,
            ));
        }

        let mut config_changed = false;
        for entry in entries {
            if entry.index <= self.log.last_index() {
                if self.term_at(entry.index) == entry.term {
                    continue;
                }
                // Conflict: drop our divergent suffix.
                self.log.truncate_suffix(entry.index)?;
                config_changed = true;
            }
            if entry.kind == EntryKind::Configuration {
                self.servers = decode_members(&entry.data)?;
                config_changed = false;
            }
            self.log.append(std::slice::from_ref(&entry))?;
        }
        if config_changed {
            self.rescan_configuration()?;
        }

        let last = self.log.last_index().max(self.snapshot_last_index);
        if leader_commit > self.commit_index {
            self.commit_index = leader_commit.min(last);
        }

        Ok((
            RaftMessage::AppendEntriesResponse {
                term: self.current_term,
                success: true,
                match_index: last,
            },
            true,
        ))
    }

    fn handle_append_response(
        &mut self,
        term: u64,
        success: bool,
        match_index: u64,
        from: &str,
    ) -> Result<Vec<Outbound>> {
        if term > self.current_term {
            self.step_down(term)?;
            return Ok(Vec::new());
        }
        if self.state != NodeState::Leader {
            return Ok(Vec::new());
        }

        if success {
            self.next_index.insert(from.to_string(), match_index + 1);
            self.match_index.insert(from.to_string(), match_index);
            self.try_advance_commit();
            // Keep pushing if the peer is still behind.
            if match_index < self.log.last_index() {
                if let Some(peer) = self.peers().find(|p| p.id == from).cloned() {
                    return Ok(vec![self.replication_for(&peer)?]);
                }
            }
        } else if let Some(next) = self.next_index.get_mut(from) {
            *next = next.saturating_sub(1).max(1);
            if let Some(peer) = self.peers().find(|p| p.id == from).cloned() {
                return Ok(vec![self.replication_for(&peer)?]);
            }
        }
        Ok(Vec::new())
    }

    /// Record a successfully installed snapshot on a follower.
    pub fn snapshot_installed(&mut self, from: &str, index: u64) -> Result<Vec<Outbound>> {
        if self.state != NodeState::Leader {
            return Ok(Vec::new());
        }
        self.next_index.insert(from.to_string(), index + 1);
        self.match_index.insert(from.to_string(), index);
        self.try_advance_commit();
        Ok(Vec::new())
    }

    /// Follower side of InstallSnapshot, after the runtime restored the
    /// FSM: adopt the snapshot's boundary and membership.
    pub fn adopt_snapshot(&mut self, meta: &SnapshotMeta, leader: (&str, &str)) -> Result<()> {
        self.step_down(meta.term.max(self.current_term))?;
        self.leader = Some((leader.0.to_string(), leader.1.to_string()));
        self.log.reset_to(meta.index + 1)?;
        self.snapshot_last_index = meta.index;
        self.snapshot_last_term = meta.term;
        self.commit_index = meta.index;
        self.last_applied = meta.index;
        self.servers = meta.members.clone();
        Ok(())
    }

    /// Leader bookkeeping after the runtime wrote a snapshot.
    pub fn snapshot_taken(&mut self, meta: &SnapshotMeta) -> Result<()> {
        self.snapshot_last_index = meta.index;
        self.snapshot_last_term = self.term_at(meta.index).max(meta.term);
        self.log.delete_range(self.log.first_index(), meta.index)?;
        Ok(())
    }

    fn try_advance_commit(&mut self) {
        if self.state != NodeState::Leader {
            return;
        }
        let last = self.log.last_index();
        for candidate in (self.commit_index + 1)..=last {
            // A leader only commits entries from its own term by counting.
            if self.term_at(candidate) != self.current_term {
                continue;
            }
            let mut count = 1;
            for peer in self.servers.iter().filter(|s| s.id != self.id) {
                if self.match_index.get(&peer.id).copied().unwrap_or(0) >= candidate {
                    count += 1;
                }
            }
            if count >= self.quorum() {
                self.commit_index = candidate;
            }
        }
    }

    /// Committed entries not yet applied, in order. Advances
    /// `last_applied`.
    pub fn take_applicable(&mut self) -> Result<Vec<LogEntry>> {
        let mut out = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            if self.last_applied <= self.snapshot_last_index {
                continue;
            }
            out.push(self.log.entry(self.last_applied)?);
        }
        Ok(out)
    }

    // -- membership ---------------------------------------------------

    /// Add a voter, replacing any stale entry with the same id or
    /// address. A no-op when the exact pair is already present.
    pub fn add_server(&mut self, id: &str, addr: &str) -> Result<Vec<Outbound>> {
        if self.state != NodeState::Leader {
            return Err(Error::NotLeader {
                leader_addr: self.leader_addr(),
            });
        }
        if self
            .servers
            .iter()
            .any(|s| s.id == id && s.addr == addr)
        {
            return Ok(Vec::new());
        }

        let mut members: Vec<ServerConfig> = self
            .servers
            .iter()
            .filter(|s| s.id != id && s.addr != addr)
            .cloned()
            .collect();
        members.push(ServerConfig {
            id: id.to_string(),
            addr: addr.to_string(),
        });

        info!(id, addr, "adding voter");
        self.propose(EntryKind::Configuration, encode_members(&members)?)?;
        self.replicate_all()
    }

    /// Remove a server from the configuration.
    pub fn remove_server(&mut self, id: &str) -> Result<Vec<Outbound>> {
        if self.state != NodeState::Leader {
            return Err(Error::NotLeader {
                leader_addr: self.leader_addr(),
            });
        }
        if !self.servers.iter().any(|s| s.id == id) {
            return Ok(Vec::new());
        }
        let members: Vec<ServerConfig> = self
            .servers
            .iter()
            .filter(|s| s.id != id)
            .cloned()
            .collect();

        info!(id, "removing server");
        self.propose(EntryKind::Configuration, encode_members(&members)?)?;
        self.next_index.remove(id);
        self.match_index.remove(id);
        self.replicate_all()
    }

    fn apply_configuration(&mut self, entry: &LogEntry) -> Result<()> {
        self.servers = decode_members(&entry.data)?;
        if self.state == NodeState::Leader {
            let last = self.log.last_index();
            for peer in self.servers.clone() {
                if peer.id != self.id {
                    self.next_index.entry(peer.id.clone()).or_insert(last);
                    self.match_index.entry(peer.id).or_insert(0);
                }
            }
        }
        Ok(())
    }
}

pub fn encode_members(members: &[ServerConfig]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(members)?)
}

pub fn decode_members(data: &[u8]) -> Result<Vec<ServerConfig>> {
    Ok(bincode::deserialize(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftlog_storage::LogConfig;
    use tempfile::TempDir;

    fn node(dir: &TempDir, id: &str) -> RaftNode {
        let log = RaftLogStore::open(dir.path().join("log"), LogConfig::default()).unwrap();
        let stable = StableStore::open(dir.path().join("stable")).unwrap();
        let config = RaftConfig::new(id);
        RaftNode::new(format!("127.0.0.1:0/{}", id), config, log, stable).unwrap()
    }

    fn with_members(mut n: RaftNode, ids: &[&str]) -> RaftNode {
        n.servers = ids
            .iter()
            .map(|id| ServerConfig {
                id: id.to_string(),
                addr: format!("127.0.0.1:0/{}", id),
            })
            .collect();
        n
    }

    #[test]
    fn new_node_is_follower() {
        let dir = TempDir::new().unwrap();
        let n = node(&dir, "a");
        assert_eq!(n.state(), NodeState::Follower);
        assert_eq!(n.current_term(), 0);
    }

    #[test]
    fn non_voter_stays_passive_on_timeout() {
        let dir = TempDir::new().unwrap();
        let mut n = node(&dir, "a");
        let out = n.start_election().unwrap();
        assert!(out.is_empty());
        assert_eq!(n.state(), NodeState::Follower);
    }

    #[test]
    fn single_voter_elects_itself() {
        let dir = TempDir::new().unwrap();
        let mut n = with_members(node(&dir, "a"), &["a"]);
        n.start_election().unwrap();
        assert_eq!(n.state(), NodeState::Leader);
        assert_eq!(n.current_term(), 1);
        // The no-op commits immediately with a quorum of one.
        assert_eq!(n.commit_index(), 1);
    }

    #[test]
    fn majority_vote_wins() {
        let dir = TempDir::new().unwrap();
        let mut n = with_members(node(&dir, "a"), &["a", "b", "c"]);

        let out = n.start_election().unwrap();
        assert_eq!(out.len(), 2); // vote requests to b and c
        assert_eq!(n.state(), NodeState::Candidate);

        n.handle_vote_response(1, true, "b").unwrap();
        assert_eq!(n.state(), NodeState::Leader);
    }

    #[test]
    fn higher_term_forces_step_down() {
        let dir = TempDir::new().unwrap();
        let mut n = with_members(node(&dir, "a"), &["a"]);
        n.start_election().unwrap();
        assert!(n.is_leader());

        n.handle_vote_response(9, false, "b").unwrap();
        assert_eq!(n.state(), NodeState::Follower);
        assert_eq!(n.current_term(), 9);
    }

    #[test]
    fn vote_granted_once_per_term() {
        let dir = TempDir::new().unwrap();
        let mut n = with_members(node(&dir, "a"), &["a", "b", "c"]);

        let (resp, _) = n.handle_request_vote(1, "b", 0, 0).unwrap();
        assert!(matches!(resp, RaftMessage::RequestVoteResponse { vote_granted: true, .. }));

        let (resp, _) = n.handle_request_vote(1, "c", 0, 0).unwrap();
        assert!(matches!(resp, RaftMessage::RequestVoteResponse { vote_granted: false, .. }));
    }

    #[test]
    fn stale_candidate_log_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut n = with_members(node(&dir, "a"), &["a", "b"]);
        n.log
            .append(&[LogEntry::new(1, 2, EntryKind::Command, vec![1])])
            .unwrap();
        n.current_term = 2;

        // Candidate's last term (1) is behind ours (2).
        let (resp, _) = n.handle_request_vote(3, "b", 5, 1).unwrap();
        assert!(matches!(resp, RaftMessage::RequestVoteResponse { vote_granted: false, .. }));
    }

    #[test]
    fn append_entries_rejects_inconsistent_prev() {
        let dir = TempDir::new().unwrap();
        let mut n = with_members(node(&dir, "a"), &["a", "b"]);

        let (resp, reset) = n
            .handle_append_entries(
                1,
                "b",
                "addr-b",
                5, // we have nothing at index 5
                1,
                vec![LogEntry::new(6, 1, EntryKind::Command, vec![])],
                0,
            )
            .unwrap();
        assert!(matches!(resp, RaftMessage::AppendEntriesResponse { success: false, .. }));
        assert!(reset); // heard from a live leader all the same
    }

    #[test]
    fn append_entries_appends_and_commits() {
        let dir = TempDir::new().unwrap();
        let mut n = with_members(node(&dir, "a"), &["a", "b"]);

        let entries = vec![
            LogEntry::new(1, 1, EntryKind::Command, b"x".to_vec()),
            LogEntry::new(2, 1, EntryKind::Command, b"y".to_vec()),
        ];
        let (resp, _) = n
            .handle_append_entries(1, "b", "addr-b", 0, 0, entries, 2)
            .unwrap();
        match resp {
            RaftMessage::AppendEntriesResponse {
                success,
                match_index,
                ..
            } => {
                assert!(success);
                assert_eq!(match_index, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(n.commit_index(), 2);
        let applicable = n.take_applicable().unwrap();
        assert_eq!(applicable.len(), 2);
        assert_eq!(applicable[1].data, b"y");
    }

    #[test]
    fn conflicting_suffix_is_replaced() {
        let dir = TempDir::new().unwrap();
        let mut n = with_members(node(&dir, "a"), &["a", "b"]);
        n.log
            .append(&[
                LogEntry::new(1, 1, EntryKind::Command, b"old1".to_vec()),
                LogEntry::new(2, 1, EntryKind::Command, b"old2".to_vec()),
            ])
            .unwrap();

        // The leader replaces index 2 with a term-2 entry.
        let (resp, _) = n
            .handle_append_entries(
                2,
                "b",
                "addr-b",
                1,
                1,
                vec![LogEntry::new(2, 2, EntryKind::Command, b"new2".to_vec())],
                0,
            )
            .unwrap();
        assert!(matches!(resp, RaftMessage::AppendEntriesResponse { success: true, .. }));
        assert_eq!(n.log.entry(2).unwrap().term, 2);
        assert_eq!(n.log.entry(2).unwrap().data, b"new2");
    }

    #[test]
    fn leader_commits_over_quorum() {
        let dir = TempDir::new().unwrap();
        let mut n = with_members(node(&dir, "a"), &["a", "b", "c"]);
        n.start_election().unwrap();
        n.handle_vote_response(1, true, "b").unwrap();
        assert!(n.is_leader());
        // become_leader appended the noop at index 1.

        let index = n.propose(EntryKind::Command, b"cmd".to_vec()).unwrap();
        assert_eq!(index, 2);
        assert_eq!(n.commit_index(), 0); // not yet acknowledged

        n.handle_append_response(1, true, 2, "b").unwrap();
        assert_eq!(n.commit_index(), 2);
    }

    #[test]
    fn propose_fails_on_follower() {
        let dir = TempDir::new().unwrap();
        let mut n = with_members(node(&dir, "a"), &["a", "b", "c"]);
        let err = n.propose(EntryKind::Command, vec![]).unwrap_err();
        assert!(err.is_not_leader());
    }

    #[test]
    fn join_is_idempotent_and_replaces_stale_addr() {
        let dir = TempDir::new().unwrap();
        let mut n = with_members(node(&dir, "a"), &["a"]);
        n.start_election().unwrap();

        n.add_server("b", "addr-b").unwrap();
        assert_eq!(n.servers.len(), 2);

        // Exact duplicate: no new configuration entry.
        let last = n.log.last_index();
        n.add_server("b", "addr-b").unwrap();
        assert_eq!(n.log.last_index(), last);

        // Same id, new address: the old entry is replaced.
        n.add_server("b", "addr-b2").unwrap();
        assert_eq!(n.servers.len(), 2);
        assert!(n.servers.iter().any(|s| s.id == "b" && s.addr == "addr-b2"));
    }

    #[test]
    fn leave_removes_server() {
        let dir = TempDir::new().unwrap();
        let mut n = with_members(node(&dir, "a"), &["a"]);
        n.start_election().unwrap();
        n.add_server("b", "addr-b").unwrap();

        n.remove_server("b").unwrap();
        assert_eq!(n.servers.len(), 1);
        assert_eq!(n.servers[0].id, "a");
    }

    #[test]
    fn bootstrap_once() {
        let dir = TempDir::new().unwrap();
        let mut n = node(&dir, "a");
        n.bootstrap().unwrap();
        assert_eq!(n.servers.len(), 1);
        assert_eq!(n.log.last_index(), 1);

        // Second bootstrap is a no-op because state exists.
        n.bootstrap().unwrap();
        assert_eq!(n.log.last_index(), 1);
    }

    #[test]
    fn servers_reports_leader_flag() {
        let dir = TempDir::new().unwrap();
        let mut n = with_members(node(&dir, "a"), &["a"]);
        n.start_election().unwrap();
        n.add_server("b", "addr-b").unwrap();

        let servers = n.servers();
        let me = servers.iter().find(|s| s.id == "a").unwrap();
        let other = servers.iter().find(|s| s.id == "b").unwrap();
        assert!(me.is_leader);
        assert!(!other.is_leader);
    }
}
