//! The driftlog node: gRPC produce/consume surface, single-port
//! connection mux, gossip membership, and the agent that assembles all of
//! it on top of the replicated log.

pub mod agent;
pub mod error;
pub mod grpc;
pub mod membership;
pub mod mux;

pub use agent::{Agent, AgentConfig};
pub use error::{Error, Result};
pub use grpc::{CommitLog, LogService, ServerProvider};
pub use membership::{Membership, MembershipConfig, MembershipHandler};
