//! Cluster-aware client.
//!
//! A [`Resolver`] turns one bootstrap address into the live member list,
//! each entry tagged with leadership. [`ClusterClient`] keeps that list
//! fresh and routes writes to the leader and reads round-robin across the
//! cluster.

pub mod client;
pub mod error;
pub mod resolver;

pub use client::ClusterClient;
pub use error::{Error, Result};
pub use resolver::{Resolver, ServerEndpoint};
