//! Cluster resolver.
//!
//! Resolution dials the bootstrap endpoint, asks it for the member list,
//! and returns every server's address tagged with whether it is the
//! leader. The bootstrap connection is cached under a mutex and dropped
//! on failure so the next call re-dials.

use driftlog_proto::{GetServersRequest, LogClient};
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tracing::debug;

use crate::error::Result;

/// One resolved cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub id: String,
    pub addr: String,
    pub is_leader: bool,
}

pub struct Resolver {
    bootstrap_addr: String,
    conn: Mutex<Option<LogClient<Channel>>>,
}

impl Resolver {
    /// A resolver for the cluster reachable through `bootstrap_addr`
    /// (any member works; followers answer `GetServers` too).
    pub fn new(bootstrap_addr: impl Into<String>) -> Self {
        Self {
            bootstrap_addr: bootstrap_addr.into(),
            conn: Mutex::new(None),
        }
    }

    /// Fetch the current member list.
    pub async fn resolve(&self) -> Result<Vec<ServerEndpoint>> {
        let mut conn = self.conn.lock().await;
        let client = match conn.take() {
            Some(client) => conn.insert(client),
            None => {
                debug!(bootstrap = %self.bootstrap_addr, "dialing bootstrap endpoint");
                let client =
                    LogClient::connect(format!("http://{}", self.bootstrap_addr)).await?;
                conn.insert(client)
            }
        };
        match client.get_servers(GetServersRequest {}).await {
            Ok(resp) => Ok(resp
                .into_inner()
                .servers
                .into_iter()
                .map(|s| ServerEndpoint {
                    id: s.id,
                    addr: s.rpc_addr,
                    is_leader: s.is_leader,
                })
                .collect()),
            Err(status) => {
                // Drop the cached connection; the next resolve re-dials.
                *conn = None;
                Err(status.into())
            }
        }
    }

    /// Re-query the member list; identical to [`Resolver::resolve`], kept
    /// as the explicit refresh entry point.
    pub async fn resolve_now(&self) -> Result<Vec<ServerEndpoint>> {
        self.resolve().await
    }
}
