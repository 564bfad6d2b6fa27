//! Resolver and routing tests against stub servers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use driftlog_client::{ClusterClient, Resolver, ServerEndpoint};
use driftlog_proto::{
    log_server::{Log, LogServer},
    ConsumeRequest, ConsumeResponse, GetServersRequest, GetServersResponse, ProduceRequest,
    ProduceResponse, Record, Server,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{Request, Response, Status, Streaming};

/// A stub node: serves a fixed member list, counts produces, and answers
/// consumes with a canned record.
struct StubNode {
    servers: Arc<std::sync::Mutex<Vec<Server>>>,
    produces: Arc<AtomicU64>,
}

#[tonic::async_trait]
impl Log for StubNode {
    async fn produce(
        &self,
        _request: Request<ProduceRequest>,
    ) -> Result<Response<ProduceResponse>, Status> {
        let offset = self.produces.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(ProduceResponse { offset }))
    }

    async fn consume(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<ConsumeResponse>, Status> {
        let offset = request.into_inner().offset;
        Ok(Response::new(ConsumeResponse {
            record: Some(Record {
                value: b"stub".to_vec(),
                offset,
                ..Default::default()
            }),
        }))
    }

    type ProduceStreamStream = ReceiverStream<Result<ProduceResponse, Status>>;

    async fn produce_stream(
        &self,
        request: Request<Streaming<ProduceRequest>>,
    ) -> Result<Response<Self::ProduceStreamStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let produces = self.produces.clone();
        tokio::spawn(async move {
            while let Ok(Some(_)) = inbound.message().await {
                let offset = produces.fetch_add(1, Ordering::SeqCst);
                if tx.send(Ok(ProduceResponse { offset })).await.is_err() {
                    return;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type ConsumeStreamStream = ReceiverStream<Result<ConsumeResponse, Status>>;

    async fn consume_stream(
        &self,
        _request: Request<ConsumeRequest>,
    ) -> Result<Response<Self::ConsumeStreamStream>, Status> {
        Err(Status::unimplemented("not needed by these tests"))
    }

    async fn get_servers(
        &self,
        _request: Request<GetServersRequest>,
    ) -> Result<Response<GetServersResponse>, Status> {
        Ok(Response::new(GetServersResponse {
            servers: self.servers.lock().unwrap().clone(),
        }))
    }
}

async fn spawn_stub(
    servers: Arc<std::sync::Mutex<Vec<Server>>>,
    produces: Arc<AtomicU64>,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let node = StubNode { servers, produces };
    tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(LogServer::new(node))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );
    addr
}

#[tokio::test]
async fn resolver_returns_tagged_members() {
    let servers = Arc::new(std::sync::Mutex::new(Vec::new()));
    let produces = Arc::new(AtomicU64::new(0));
    let addr = spawn_stub(servers.clone(), produces).await;

    *servers.lock().unwrap() = vec![
        Server {
            id: "node-0".to_string(),
            rpc_addr: "localhost:9001".to_string(),
            is_leader: true,
        },
        Server {
            id: "node-1".to_string(),
            rpc_addr: "localhost:9002".to_string(),
            is_leader: false,
        },
    ];

    let resolver = Resolver::new(addr);
    let endpoints = resolver.resolve().await.unwrap();
    assert_eq!(
        endpoints,
        vec![
            ServerEndpoint {
                id: "node-0".to_string(),
                addr: "localhost:9001".to_string(),
                is_leader: true,
            },
            ServerEndpoint {
                id: "node-1".to_string(),
                addr: "localhost:9002".to_string(),
                is_leader: false,
            },
        ]
    );

    // An explicit refresh returns the same state.
    let again = resolver.resolve_now().await.unwrap();
    assert_eq!(again, endpoints);
}

#[tokio::test]
async fn produce_routes_to_leader() {
    // Two stub nodes; both report the same membership where only one
    // leads.
    let leader_produces = Arc::new(AtomicU64::new(0));
    let follower_produces = Arc::new(AtomicU64::new(0));

    let leader_servers = Arc::new(std::sync::Mutex::new(Vec::new()));
    let follower_servers = Arc::new(std::sync::Mutex::new(Vec::new()));

    let leader_addr = spawn_stub(leader_servers.clone(), leader_produces.clone()).await;
    let follower_addr = spawn_stub(follower_servers.clone(), follower_produces.clone()).await;

    let membership = vec![
        Server {
            id: "leader".to_string(),
            rpc_addr: leader_addr.clone(),
            is_leader: true,
        },
        Server {
            id: "follower".to_string(),
            rpc_addr: follower_addr.clone(),
            is_leader: false,
        },
    ];
    *leader_servers.lock().unwrap() = membership.clone();
    *follower_servers.lock().unwrap() = membership;

    // Bootstrap through the follower; writes still land on the leader.
    let client = ClusterClient::connect(follower_addr).await.unwrap();
    for want in 0..3u64 {
        let offset = client.produce(b"value".to_vec()).await.unwrap();
        assert_eq!(offset, want);
    }
    assert_eq!(leader_produces.load(Ordering::SeqCst), 3);
    assert_eq!(follower_produces.load(Ordering::SeqCst), 0);

    // Reads rotate across both members.
    for _ in 0..4 {
        let record = client.consume(0).await.unwrap();
        assert_eq!(record.value, b"stub");
    }
}
