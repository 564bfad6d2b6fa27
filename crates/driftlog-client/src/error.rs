//! Client error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    /// The resolved member list has no server flagged as leader yet;
    /// retry after re-resolving.
    #[error("cluster has no known leader")]
    NoLeader,

    #[error("resolver returned no servers")]
    NoServers,
}
