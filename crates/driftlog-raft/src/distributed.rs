//! The replicated log: a local segmented log behind the consensus engine.
//!
//! Appends are serialized into `[req_type][proto payload]` commands and
//! submitted to the leader; once a quorum commits, every replica's FSM
//! appends the record locally and the assigned offset flows back to the
//! caller. Reads are served from the local log on any node.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use driftlog_proto::{ProduceRequest, ProduceResponse, Record, Server};
use driftlog_storage::{Log, LogConfig};
use prost::Message;

use crate::config::RaftConfig;
use crate::error::Result;
use crate::fsm::{LogFsm, APPEND_REQUEST_TYPE};
use crate::raft::Raft;
use crate::transport::StreamLayer;

pub struct DistributedLog {
    log: Arc<Log>,
    raft: Raft,
    stream_layer: StreamLayer,
}

impl DistributedLog {
    /// Open the user log under `data_dir/log` and the consensus state
    /// under `data_dir/raft`. `advertise_addr` is the address peers dial
    /// for both gRPC and consensus traffic.
    pub fn open(
        data_dir: impl AsRef<Path>,
        raft_config: RaftConfig,
        log_config: LogConfig,
        advertise_addr: String,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let log = Arc::new(Log::open(data_dir.join("log"), log_config.clone())?);

        let fsm = Box::new(LogFsm::new(log.clone()));
        let (raft, stream_layer) =
            Raft::start(data_dir, raft_config, log_config, advertise_addr, fsm)?;

        Ok(Self {
            log,
            raft,
            stream_layer,
        })
    }

    /// Replicate and append a record, returning its cluster-wide offset.
    /// Only succeeds on the leader; followers surface `NotLeader` and the
    /// client-side resolver redirects.
    pub async fn append(&self, record: Record) -> Result<u64> {
        let req = ProduceRequest {
            record: Some(record),
        };
        let mut command = Vec::with_capacity(1 + req.encoded_len());
        command.push(APPEND_REQUEST_TYPE);
        req.encode(&mut command)?;

        let response = self.raft.apply(command).await?;
        let resp = ProduceResponse::decode(&response[..])?;
        Ok(resp.offset)
    }

    /// Read a record from the local replica. May lag the leader.
    pub fn read(&self, offset: u64) -> Result<Record> {
        Ok(self.log.read(offset)?)
    }

    /// The cluster members, annotated with leadership.
    pub async fn get_servers(&self) -> Result<Vec<Server>> {
        Ok(self
            .raft
            .servers()
            .await?
            .into_iter()
            .map(|s| Server {
                id: s.id,
                rpc_addr: s.rpc_addr,
                is_leader: s.is_leader,
            })
            .collect())
    }

    /// Add a joining node as a voter. Idempotent for an exact
    /// `(id, addr)` match; a stale entry under either key is replaced.
    pub async fn join(&self, id: &str, addr: &str) -> Result<()> {
        self.raft.join(id, addr).await
    }

    /// Remove a departed node from the cluster.
    pub async fn leave(&self, id: &str) -> Result<()> {
        self.raft.leave(id).await
    }

    /// Block until a leader is known, polling every 100 ms.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String> {
        self.raft.wait_for_leader(timeout).await
    }

    /// Handle for the server's accept loop to route consensus
    /// connections here.
    pub fn stream_layer(&self) -> StreamLayer {
        self.stream_layer.clone()
    }

    /// Shut down consensus, then close the local log (which closes every
    /// segment and truncates the indexes).
    pub async fn close(&self) -> Result<()> {
        self.raft.shutdown().await?;
        self.log.close()?;
        Ok(())
    }
}
