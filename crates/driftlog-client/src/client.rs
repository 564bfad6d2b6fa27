//! Leader-aware cluster client.
//!
//! Produces go to the leader; consumes rotate across every member so
//! followers absorb read load. On any transport or RPC failure the client
//! re-resolves the cluster once and retries, which covers leader changes
//! and member churn without surfacing every blip to the caller.

use std::collections::HashMap;

use driftlog_proto::{
    ConsumeRequest, ConsumeResponse, GetServersRequest, LogClient, ProduceRequest, Record,
};
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tonic::Streaming;
use tracing::debug;

use crate::error::{Error, Result};
use crate::resolver::{Resolver, ServerEndpoint};

struct State {
    endpoints: Vec<ServerEndpoint>,
    channels: HashMap<String, LogClient<Channel>>,
    next_read: usize,
}

pub struct ClusterClient {
    resolver: Resolver,
    state: Mutex<State>,
}

impl ClusterClient {
    /// Resolve the cluster through `bootstrap_addr` and build the client.
    pub async fn connect(bootstrap_addr: impl Into<String>) -> Result<Self> {
        let resolver = Resolver::new(bootstrap_addr);
        let endpoints = resolver.resolve().await?;
        if endpoints.is_empty() {
            return Err(Error::NoServers);
        }
        Ok(Self {
            resolver,
            state: Mutex::new(State {
                endpoints,
                channels: HashMap::new(),
                next_read: 0,
            }),
        })
    }

    /// Append a record via the leader; returns the assigned offset.
    pub async fn produce(&self, value: Vec<u8>) -> Result<u64> {
        let request = ProduceRequest {
            record: Some(Record {
                value,
                ..Default::default()
            }),
        };

        let mut client = self.leader().await?;
        match client.produce(request.clone()).await {
            Ok(resp) => Ok(resp.into_inner().offset),
            Err(status) => {
                debug!(error = %status, "produce failed, re-resolving leader");
                self.refresh().await?;
                let mut client = self.leader().await?;
                Ok(client.produce(request).await?.into_inner().offset)
            }
        }
    }

    /// Read the record at `offset` from the next member in rotation.
    pub async fn consume(&self, offset: u64) -> Result<Record> {
        let mut client = self.next_member().await?;
        let request = ConsumeRequest { offset };
        match client.consume(request.clone()).await {
            Ok(resp) => Ok(resp.into_inner().record.unwrap_or_default()),
            Err(status) if status.code() == tonic::Code::NotFound => Err(status.into()),
            Err(status) => {
                debug!(error = %status, "consume failed, re-resolving");
                self.refresh().await?;
                let mut client = self.next_member().await?;
                Ok(client
                    .consume(request)
                    .await?
                    .into_inner()
                    .record
                    .unwrap_or_default())
            }
        }
    }

    /// Open a server stream of every record from `offset` onward.
    pub async fn consume_stream(&self, offset: u64) -> Result<Streaming<ConsumeResponse>> {
        let mut client = self.next_member().await?;
        Ok(client
            .consume_stream(ConsumeRequest { offset })
            .await?
            .into_inner())
    }

    /// Stream a batch of records to the leader; returns assigned offsets
    /// in order.
    pub async fn produce_stream(&self, values: Vec<Vec<u8>>) -> Result<Vec<u64>> {
        let requests: Vec<ProduceRequest> = values
            .into_iter()
            .map(|value| ProduceRequest {
                record: Some(Record {
                    value,
                    ..Default::default()
                }),
            })
            .collect();
        let count = requests.len();

        let mut client = self.leader().await?;
        let mut responses = client
            .produce_stream(tokio_stream::iter(requests))
            .await?
            .into_inner();

        let mut offsets = Vec::with_capacity(count);
        while let Some(resp) = responses.message().await? {
            offsets.push(resp.offset);
        }
        Ok(offsets)
    }

    /// The member list as last resolved.
    pub async fn servers(&self) -> Result<Vec<ServerEndpoint>> {
        // Served from any member; also refreshes the cached list.
        let mut client = self.next_member().await?;
        let servers = client
            .get_servers(GetServersRequest {})
            .await?
            .into_inner()
            .servers;
        let endpoints: Vec<ServerEndpoint> = servers
            .into_iter()
            .map(|s| ServerEndpoint {
                id: s.id,
                addr: s.rpc_addr,
                is_leader: s.is_leader,
            })
            .collect();
        let mut state = self.state.lock().await;
        state.endpoints = endpoints.clone();
        Ok(endpoints)
    }

    async fn refresh(&self) -> Result<()> {
        let endpoints = self.resolver.resolve_now().await?;
        if endpoints.is_empty() {
            return Err(Error::NoServers);
        }
        let mut state = self.state.lock().await;
        state.channels.retain(|addr, _| {
            endpoints.iter().any(|e| e.addr == *addr)
        });
        state.endpoints = endpoints;
        Ok(())
    }

    async fn leader(&self) -> Result<LogClient<Channel>> {
        let addr = {
            let state = self.state.lock().await;
            state
                .endpoints
                .iter()
                .find(|e| e.is_leader)
                .map(|e| e.addr.clone())
        };
        match addr {
            Some(addr) => self.channel(&addr).await,
            None => {
                // Maybe an election just finished; look again.
                self.refresh().await?;
                let state = self.state.lock().await;
                let addr = state
                    .endpoints
                    .iter()
                    .find(|e| e.is_leader)
                    .map(|e| e.addr.clone())
                    .ok_or(Error::NoLeader)?;
                drop(state);
                self.channel(&addr).await
            }
        }
    }

    async fn next_member(&self) -> Result<LogClient<Channel>> {
        let addr = {
            let mut state = self.state.lock().await;
            if state.endpoints.is_empty() {
                return Err(Error::NoServers);
            }
            let index = state.next_read % state.endpoints.len();
            state.next_read = state.next_read.wrapping_add(1);
            state.endpoints[index].addr.clone()
        };
        self.channel(&addr).await
    }

    async fn channel(&self, addr: &str) -> Result<LogClient<Channel>> {
        let mut state = self.state.lock().await;
        if let Some(client) = state.channels.get(addr) {
            return Ok(client.clone());
        }
        let client = LogClient::connect(format!("http://{}", addr)).await?;
        state.channels.insert(addr.to_string(), client.clone());
        Ok(client)
    }
}
