//! Raft wire messages and log entry types.
//!
//! Messages travel between peers as bincode-encoded [`Envelope`] frames
//! over the stream layer. An `AppendEntries` with no entries doubles as the
//! heartbeat.

use serde::{Deserialize, Serialize};

use crate::snapshot::SnapshotMeta;

/// A voter in the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub addr: String,
}

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A client command applied to the FSM on commit.
    Command,
    /// Appended by a fresh leader to commit entries from earlier terms.
    Noop,
    /// A cluster membership change; active as soon as it is appended.
    Configuration,
}

impl EntryKind {
    pub fn as_u32(self) -> u32 {
        match self {
            EntryKind::Command => 0,
            EntryKind::Noop => 1,
            EntryKind::Configuration => 2,
        }
    }

    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => EntryKind::Noop,
            2 => EntryKind::Configuration,
            _ => EntryKind::Command,
        }
    }
}

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, kind: EntryKind, data: Vec<u8>) -> Self {
        Self {
            index,
            term,
            kind,
            data,
        }
    }
}

/// All messages exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote {
        term: u64,
        candidate_id: String,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        term: u64,
        vote_granted: bool,
    },
    AppendEntries {
        term: u64,
        leader_id: String,
        leader_addr: String,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        term: u64,
        success: bool,
        /// Highest index known replicated on the sender when successful;
        /// lets the leader advance `next_index` past batches.
        match_index: u64,
    },
    InstallSnapshot {
        term: u64,
        leader_id: String,
        leader_addr: String,
        meta: SnapshotMeta,
        data: Vec<u8>,
    },
    InstallSnapshotResponse {
        term: u64,
        /// Last index covered by the installed snapshot, so the leader can
        /// resume replication right after it.
        last_index: u64,
    },
}

/// Frame carried on the wire: the sender's identity plus the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from_id: String,
    pub from_addr: String,
    pub msg: RaftMessage,
}
