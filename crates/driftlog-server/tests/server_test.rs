//! gRPC surface tests against a plain local log, exercising the service
//! through a real client connection.

use std::sync::Arc;

use async_trait::async_trait;
use driftlog_proto::{
    log_server::LogServer, ConsumeRequest, GetServersRequest, LogClient, ProduceRequest, Record,
    Server,
};
use driftlog_server::{LogService, ServerProvider};
use driftlog_storage::{Log, LogConfig};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Channel;
use tonic::Code;

struct StaticServers(Vec<Server>);

#[async_trait]
impl ServerProvider for StaticServers {
    async fn get_servers(&self) -> driftlog_raft::Result<Vec<Server>> {
        Ok(self.0.clone())
    }
}

async fn setup() -> (LogClient<Channel>, TempDir) {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(Log::open(dir.path(), LogConfig::default()).unwrap());
    let servers = Arc::new(StaticServers(vec![Server {
        id: "node-0".to_string(),
        rpc_addr: "127.0.0.1:9001".to_string(),
        is_leader: true,
    }]));
    let service = LogService::new(log, servers);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(LogServer::new(service))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );

    let client = LogClient::connect(format!("http://{}", addr)).await.unwrap();
    (client, dir)
}

fn produce_request(value: &str) -> ProduceRequest {
    ProduceRequest {
        record: Some(Record {
            value: value.as_bytes().to_vec(),
            ..Default::default()
        }),
    }
}

#[tokio::test]
async fn produce_consume_roundtrip() {
    let (mut client, _dir) = setup().await;

    let produce = client
        .produce(produce_request("hello world"))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(produce.offset, 0);

    let consume = client
        .consume(ConsumeRequest { offset: 0 })
        .await
        .unwrap()
        .into_inner();
    let record = consume.record.unwrap();
    assert_eq!(record.value, b"hello world");
    assert_eq!(record.offset, 0);
}

#[tokio::test]
async fn consume_past_boundary_is_not_found() {
    let (mut client, _dir) = setup().await;

    client.produce(produce_request("hello world")).await.unwrap();

    let status = client
        .consume(ConsumeRequest { offset: 1 })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
    assert!(
        status.message().contains("offset 1"),
        "unexpected message: {}",
        status.message()
    );
}

#[tokio::test]
async fn produce_and_consume_streams() {
    let (mut client, _dir) = setup().await;

    // Stream two records in; offsets come back in order.
    let requests = tokio_stream::iter(vec![
        produce_request("first"),
        produce_request("second"),
    ]);
    let mut responses = client.produce_stream(requests).await.unwrap().into_inner();
    assert_eq!(responses.message().await.unwrap().unwrap().offset, 0);
    assert_eq!(responses.message().await.unwrap().unwrap().offset, 1);
    assert!(responses.message().await.unwrap().is_none());

    // Stream them back from offset 0.
    let mut stream = client
        .consume_stream(ConsumeRequest { offset: 0 })
        .await
        .unwrap()
        .into_inner();
    let first = stream.message().await.unwrap().unwrap().record.unwrap();
    assert_eq!(first.value, b"first");
    assert_eq!(first.offset, 0);
    let second = stream.message().await.unwrap().unwrap().record.unwrap();
    assert_eq!(second.value, b"second");
    assert_eq!(second.offset, 1);

    // The stream keeps waiting for records appended after it started.
    client.produce(produce_request("third")).await.unwrap();
    let third = stream.message().await.unwrap().unwrap().record.unwrap();
    assert_eq!(third.value, b"third");
    assert_eq!(third.offset, 2);
}

#[tokio::test]
async fn get_servers_reports_membership() {
    let (mut client, _dir) = setup().await;

    let servers = client
        .get_servers(GetServersRequest {})
        .await
        .unwrap()
        .into_inner()
        .servers;
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].id, "node-0");
    assert!(servers[0].is_leader);
}
