//! Consensus error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] driftlog_storage::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation requires the leader; the hint carries the leader's
    /// address when known so callers can redirect.
    #[error("node is not the leader")]
    NotLeader { leader_addr: Option<String> },

    #[error("timed out waiting for a leader")]
    NoLeader,

    /// An apply was submitted but did not commit within the bounded wait.
    #[error("apply timed out")]
    ApplyTimeout,

    /// Leadership was lost while an apply was in flight; the command may or
    /// may not commit.
    #[error("leadership lost before commit")]
    LeadershipLost,

    #[error("raft engine is shut down")]
    Shutdown,

    #[error("wire decode error: {0}")]
    Wire(#[from] bincode::Error),

    #[error("metadata decode error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("command decode error: {0}")]
    Command(#[from] prost::DecodeError),

    #[error("command encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True for the membership-bridge case that is logged at debug level:
    /// a follower cannot effect membership changes, the leader's bridge
    /// will.
    pub fn is_not_leader(&self) -> bool {
        matches!(self, Error::NotLeader { .. })
    }
}
