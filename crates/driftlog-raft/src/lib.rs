//! Leader-based replication for the driftlog commit log.
//!
//! This crate layers a deterministic state machine over a Raft consensus
//! log. Client appends are serialized into commands, replicated to a quorum
//! and applied to the local [`driftlog_storage::Log`] in commit order, so
//! every replica's offset-to-record mapping is identical for committed
//! prefixes.
//!
//! The pieces:
//!
//! - [`node`]: the pure Raft state machine (elections, log replication,
//!   commitment)
//! - [`store`]: the consensus log persisted in a segmented log of its own
//! - [`stable`] / [`snapshot`]: term/vote persistence and snapshot files
//! - [`fsm`]: the state-machine hook applied on commit
//! - [`transport`]: the stream layer multiplexed over the node's RPC
//!   listener
//! - [`raft`]: the runtime driving all of the above
//! - [`distributed`]: the replicated log facade the server talks to

pub mod config;
pub mod distributed;
pub mod error;
pub mod fsm;
pub mod message;
pub mod node;
pub mod raft;
pub mod snapshot;
pub mod stable;
pub mod store;
pub mod transport;

pub use config::RaftConfig;
pub use distributed::DistributedLog;
pub use error::{Error, Result};
pub use message::{EntryKind, LogEntry, RaftMessage, ServerConfig};
pub use node::ServerInfo;
pub use raft::Raft;
pub use transport::{StreamLayer, RAFT_RPC};
