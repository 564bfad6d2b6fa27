//! Server error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("consensus error: {0}")]
    Raft(#[from] driftlog_raft::Error),

    #[error("gossip codec error: {0}")]
    Gossip(#[from] serde_json::Error),
}
