//! gRPC Log service.
//!
//! The service sits behind two seams so it never holds a back-pointer to
//! the node that owns it: [`CommitLog`] for the data path and
//! [`ServerProvider`] for cluster discovery. In production both are the
//! replicated log; tests plug in a plain storage log and a stub provider.
//!
//! Error mapping: an out-of-range offset surfaces to clients as
//! `NOT_FOUND` with the offset in the message; `ConsumeStream` treats the
//! same condition as "not written yet" and waits for future appends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use driftlog_proto::{
    log_server, ConsumeRequest, ConsumeResponse, GetServersRequest, GetServersResponse,
    ProduceRequest, ProduceResponse, Record, Server,
};
use driftlog_raft::DistributedLog;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

/// How long `ConsumeStream` sleeps while waiting for an offset to be
/// written.
const CONSUME_RETRY_INTERVAL: Duration = Duration::from_millis(50);

const STREAM_DEPTH: usize = 64;

/// The record store the service appends to and reads from.
#[async_trait]
pub trait CommitLog: Send + Sync + 'static {
    async fn append(&self, record: Record) -> driftlog_raft::Result<u64>;
    fn read(&self, offset: u64) -> driftlog_storage::Result<Record>;
}

/// Live cluster membership for client-side discovery.
#[async_trait]
pub trait ServerProvider: Send + Sync + 'static {
    async fn get_servers(&self) -> driftlog_raft::Result<Vec<Server>>;
}

#[async_trait]
impl CommitLog for DistributedLog {
    async fn append(&self, record: Record) -> driftlog_raft::Result<u64> {
        DistributedLog::append(self, record).await
    }

    fn read(&self, offset: u64) -> driftlog_storage::Result<Record> {
        match DistributedLog::read(self, offset) {
            Ok(record) => Ok(record),
            Err(driftlog_raft::Error::Storage(e)) => Err(e),
            Err(e) => Err(driftlog_storage::Error::Io(std::io::Error::other(e.to_string()))),
        }
    }
}

#[async_trait]
impl ServerProvider for DistributedLog {
    async fn get_servers(&self) -> driftlog_raft::Result<Vec<Server>> {
        DistributedLog::get_servers(self).await
    }
}

/// A plain local log satisfies the data path; appends are not replicated.
#[async_trait]
impl CommitLog for driftlog_storage::Log {
    async fn append(&self, record: Record) -> driftlog_raft::Result<u64> {
        Ok(driftlog_storage::Log::append(self, record)?)
    }

    fn read(&self, offset: u64) -> driftlog_storage::Result<Record> {
        driftlog_storage::Log::read(self, offset)
    }
}

pub struct LogService {
    commit_log: Arc<dyn CommitLog>,
    servers: Arc<dyn ServerProvider>,
}

impl LogService {
    pub fn new(commit_log: Arc<dyn CommitLog>, servers: Arc<dyn ServerProvider>) -> Self {
        Self {
            commit_log,
            servers,
        }
    }
}

#[tonic::async_trait]
impl log_server::Log for LogService {
    async fn produce(
        &self,
        request: Request<ProduceRequest>,
    ) -> std::result::Result<Response<ProduceResponse>, Status> {
        let record = request.into_inner().record.unwrap_or_default();
        let offset = self
            .commit_log
            .append(record)
            .await
            .map_err(raft_status)?;
        Ok(Response::new(ProduceResponse { offset }))
    }

    async fn consume(
        &self,
        request: Request<ConsumeRequest>,
    ) -> std::result::Result<Response<ConsumeResponse>, Status> {
        let offset = request.into_inner().offset;
        let record = self.commit_log.read(offset).map_err(storage_status)?;
        Ok(Response::new(ConsumeResponse {
            record: Some(record),
        }))
    }

    type ProduceStreamStream = ReceiverStream<std::result::Result<ProduceResponse, Status>>;

    /// Each request on the stream is appended; its response is returned in
    /// order on the same stream.
    async fn produce_stream(
        &self,
        request: Request<Streaming<ProduceRequest>>,
    ) -> std::result::Result<Response<Self::ProduceStreamStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        let commit_log = self.commit_log.clone();

        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(req)) => {
                        let result = commit_log
                            .append(req.record.unwrap_or_default())
                            .await
                            .map(|offset| ProduceResponse { offset })
                            .map_err(raft_status);
                        let failed = result.is_err();
                        if tx.send(result).await.is_err() || failed {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(status) => {
                        debug!(error = %status, "produce stream receive failed");
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type ConsumeStreamStream = ReceiverStream<std::result::Result<ConsumeResponse, Status>>;

    /// Stream every record from the requested offset onward, waiting for
    /// offsets that have not been written yet. Runs until the client goes
    /// away.
    async fn consume_stream(
        &self,
        request: Request<ConsumeRequest>,
    ) -> std::result::Result<Response<Self::ConsumeStreamStream>, Status> {
        let mut offset = request.into_inner().offset;
        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        let commit_log = self.commit_log.clone();

        tokio::spawn(async move {
            loop {
                match commit_log.read(offset) {
                    Ok(record) => {
                        let resp = ConsumeResponse {
                            record: Some(record),
                        };
                        if tx.send(Ok(resp)).await.is_err() {
                            return;
                        }
                        offset += 1;
                    }
                    Err(driftlog_storage::Error::OffsetOutOfRange(_)) => {
                        if tx.is_closed() {
                            return;
                        }
                        tokio::time::sleep(CONSUME_RETRY_INTERVAL).await;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(storage_status(e))).await;
                        return;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_servers(
        &self,
        _request: Request<GetServersRequest>,
    ) -> std::result::Result<Response<GetServersResponse>, Status> {
        let servers = self.servers.get_servers().await.map_err(raft_status)?;
        Ok(Response::new(GetServersResponse { servers }))
    }
}

fn storage_status(e: driftlog_storage::Error) -> Status {
    match e {
        driftlog_storage::Error::OffsetOutOfRange(offset) => {
            Status::not_found(format!("record at offset {} is outside log range", offset))
        }
        other => Status::internal(other.to_string()),
    }
}

fn raft_status(e: driftlog_raft::Error) -> Status {
    match e {
        driftlog_raft::Error::NotLeader { leader_addr } => Status::unavailable(match leader_addr {
            Some(addr) => format!("not the leader; leader is at {}", addr),
            None => "not the leader; no leader known".to_string(),
        }),
        driftlog_raft::Error::ApplyTimeout => Status::deadline_exceeded("apply timed out"),
        driftlog_raft::Error::Storage(e) => storage_status(e),
        other => Status::internal(other.to_string()),
    }
}
