//! The agent: one running driftlog node.
//!
//! Assembly order matters and mirrors teardown in reverse: bind the RPC
//! listener (so the advertised address is real before anything dials it),
//! open the replicated log, start the gRPC server behind the connection
//! mux, then start membership last so join events arrive once the node
//! can serve them.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use driftlog_proto::log_server::LogServer;
use driftlog_raft::{DistributedLog, RaftConfig};
use driftlog_storage::LogConfig;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info};

use crate::error::Result;
use crate::grpc::LogService;
use crate::membership::{Membership, MembershipConfig, MembershipHandler};
use crate::mux;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Root directory for the log and consensus state.
    pub data_dir: PathBuf,
    /// Unique node name; doubles as the consensus server id.
    pub node_name: String,
    /// UDP bind address for membership gossip.
    pub bind_addr: String,
    /// TCP bind address shared by gRPC and consensus traffic. Port 0
    /// binds an ephemeral port; the bound address is advertised.
    pub rpc_addr: String,
    /// Gossip addresses of existing members to join on startup.
    pub start_join_addrs: Vec<String>,
    /// Bootstrap a fresh single-node cluster.
    pub bootstrap: bool,
    /// Storage tuning for both the user log and the consensus log.
    pub log: LogConfig,
    /// Consensus timing; `local_id` and `bootstrap` are overwritten from
    /// the fields above.
    pub raft: RaftConfig,
}

impl AgentConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        let node_name = node_name.into();
        Self {
            data_dir: PathBuf::from("./data"),
            node_name: node_name.clone(),
            bind_addr: "127.0.0.1:0".to_string(),
            rpc_addr: "127.0.0.1:0".to_string(),
            start_join_addrs: Vec::new(),
            bootstrap: false,
            log: LogConfig::default(),
            raft: RaftConfig::new(node_name),
        }
    }
}

pub struct Agent {
    dlog: Arc<DistributedLog>,
    membership: Membership,
    rpc_addr: String,
    shutdown_tx: watch::Sender<bool>,
    shutdown_done: Mutex<bool>,
}

impl Agent {
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.rpc_addr).await?;
        let rpc_addr = listener.local_addr()?.to_string();

        let mut raft_config = config.raft.clone();
        raft_config.local_id = config.node_name.clone();
        raft_config.bootstrap = config.bootstrap;

        let dlog = Arc::new(DistributedLog::open(
            &config.data_dir,
            raft_config,
            config.log.clone(),
            rpc_addr.clone(),
        )?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self::serve(&dlog, listener, shutdown_rx.clone());

        let membership = Membership::start(
            MembershipConfig {
                node_name: config.node_name.clone(),
                bind_addr: config.bind_addr.clone(),
                rpc_addr: rpc_addr.clone(),
                start_join_addrs: config.start_join_addrs.clone(),
            },
            Arc::new(RaftHandler(dlog.clone())),
        )
        .await?;

        info!(name = %config.node_name, rpc = %rpc_addr, "agent started");
        Ok(Self {
            dlog,
            membership,
            rpc_addr,
            shutdown_tx,
            shutdown_done: Mutex::new(false),
        })
    }

    /// Spawn the connection mux and the gRPC server on its outflow.
    fn serve(dlog: &Arc<DistributedLog>, listener: TcpListener, shutdown: watch::Receiver<bool>) {
        let service = LogService::new(dlog.clone(), dlog.clone());
        let (grpc_tx, grpc_rx) = mpsc::channel(64);

        tokio::spawn(mux::run(
            listener,
            dlog.stream_layer(),
            grpc_tx,
            shutdown.clone(),
        ));

        let mut grpc_shutdown = shutdown;
        tokio::spawn(async move {
            let incoming = tokio_stream::wrappers::ReceiverStream::new(grpc_rx);
            let result = tonic::transport::Server::builder()
                .add_service(LogServer::new(service))
                .serve_with_incoming_shutdown(incoming, async move {
                    while grpc_shutdown.changed().await.is_ok() {
                        if *grpc_shutdown.borrow() {
                            break;
                        }
                    }
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "grpc server failed");
            }
        });
    }

    /// Address clients and peers dial, with the real port when the config
    /// asked for an ephemeral one.
    pub fn rpc_addr(&self) -> &str {
        &self.rpc_addr
    }

    /// Gossip address other agents use in `start_join_addrs`.
    pub fn gossip_addr(&self) -> &str {
        self.membership.gossip_addr()
    }

    /// The replicated log behind this agent, for in-process callers.
    pub fn distributed_log(&self) -> Arc<DistributedLog> {
        self.dlog.clone()
    }

    /// Leave the cluster and stop serving: membership first, then the
    /// gRPC/mux tasks, then consensus and the log.
    pub async fn shutdown(&self) -> Result<()> {
        let mut done = self.shutdown_done.lock().await;
        if *done {
            return Ok(());
        }
        *done = true;

        if let Err(e) = self.membership.leave().await {
            error!(error = %e, "membership leave failed");
        }
        let _ = self.shutdown_tx.send(true);
        self.dlog.close().await?;
        info!(rpc = %self.rpc_addr, "agent stopped");
        Ok(())
    }
}

/// Bridges gossip events into the consensus membership API.
struct RaftHandler(Arc<DistributedLog>);

#[async_trait]
impl MembershipHandler for RaftHandler {
    async fn join(&self, name: &str, rpc_addr: &str) -> driftlog_raft::Result<()> {
        self.0.join(name, rpc_addr).await
    }

    async fn leave(&self, name: &str) -> driftlog_raft::Result<()> {
        self.0.leave(name).await
    }
}
