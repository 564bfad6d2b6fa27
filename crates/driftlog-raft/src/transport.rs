//! Stream layer: consensus traffic multiplexed over the node's single RPC
//! listener.
//!
//! Every outbound dial writes one discriminator byte (`RAFT_RPC`) before
//! any framed data so the accept loop on the far side can route the
//! connection away from gRPC. Frames are `[len: u32 BE][bincode Envelope]`.
//! Inbound connections arrive from the server's accept loop with the
//! discriminator already consumed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::Result;
use crate::message::Envelope;

/// Discriminator byte identifying consensus connections.
pub const RAFT_RPC: u8 = 1;

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const OUTBOX_DEPTH: usize = 256;

/// Handle the server's accept loop uses to hand consensus connections to
/// the transport.
#[derive(Clone)]
pub struct StreamLayer {
    inbound: mpsc::Sender<TcpStream>,
}

impl StreamLayer {
    /// Route an accepted connection (discriminator byte already read) to
    /// the transport.
    pub async fn accept(&self, stream: TcpStream) {
        if self.inbound.send(stream).await.is_err() {
            debug!("raft transport is shut down, dropping connection");
        }
    }
}

/// Owns every consensus connection: per-peer outbound writers plus reader
/// tasks for inbound streams. Decoded envelopes flow to the runtime
/// through a single channel.
pub struct Transport {
    local_id: String,
    local_addr: String,
    outboxes: Arc<Mutex<HashMap<String, mpsc::Sender<Envelope>>>>,
}

impl Transport {
    /// Returns the transport, the handle for the server's accept loop and
    /// the stream of decoded inbound envelopes.
    pub fn new(
        local_id: String,
        local_addr: String,
    ) -> (Self, StreamLayer, mpsc::Receiver<Envelope>) {
        let (delivery_tx, delivery_rx) = mpsc::channel(OUTBOX_DEPTH);
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<TcpStream>(OUTBOX_DEPTH);

        // Reader tasks for streams handed over by the accept loop.
        tokio::spawn(async move {
            while let Some(stream) = inbound_rx.recv().await {
                tokio::spawn(read_loop(stream, delivery_tx.clone()));
            }
        });

        (
            Self {
                local_id,
                local_addr,
                outboxes: Arc::new(Mutex::new(HashMap::new())),
            },
            StreamLayer { inbound: inbound_tx },
            delivery_rx,
        )
    }

    /// Send a message to a peer, dialing lazily. A dead connection is
    /// dropped and redialed on the next send.
    pub async fn send(&self, to_addr: &str, msg: crate::message::RaftMessage) {
        let envelope = Envelope {
            from_id: self.local_id.clone(),
            from_addr: self.local_addr.clone(),
            msg,
        };

        let tx = {
            let mut outboxes = self.outboxes.lock().await;
            match outboxes.get(to_addr) {
                Some(tx) if !tx.is_closed() => tx.clone(),
                _ => {
                    let (tx, rx) = mpsc::channel(OUTBOX_DEPTH);
                    tokio::spawn(write_loop(to_addr.to_string(), rx));
                    outboxes.insert(to_addr.to_string(), tx.clone());
                    tx
                }
            }
        };

        // Backpressure is bounded: if the peer's outbox is full the
        // message is dropped and the protocol retries.
        if tx.try_send(envelope).is_err() {
            debug!(peer = to_addr, "outbox full or closed, dropping message");
        }
    }

}

async fn write_loop(addr: String, mut rx: mpsc::Receiver<Envelope>) {
    let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(peer = %addr, error = %e, "dial failed");
            return;
        }
        Err(_) => {
            debug!(peer = %addr, "dial timed out");
            return;
        }
    };
    let mut stream = stream;
    if let Err(e) = stream.write_all(&[RAFT_RPC]).await {
        debug!(peer = %addr, error = %e, "handshake write failed");
        return;
    }

    while let Some(envelope) = rx.recv().await {
        let frame = match bincode::serialize(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode envelope");
                continue;
            }
        };
        if write_frame(&mut stream, &frame).await.is_err() {
            debug!(peer = %addr, "connection lost");
            return;
        }
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> Result<()> {
    stream.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_loop(mut stream: TcpStream, delivery: mpsc::Sender<Envelope>) {
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut frame = vec![0u8; len];
        if stream.read_exact(&mut frame).await.is_err() {
            return;
        }
        match bincode::deserialize::<Envelope>(&frame) {
            Ok(envelope) => {
                if delivery.send(envelope).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RaftMessage;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn envelopes_flow_end_to_end() {
        // A stand-in for the server mux: accept, strip the discriminator,
        // hand the stream to the layer.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (transport, layer, mut delivery) =
            Transport::new("node-b".into(), addr.clone());

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut first = [0u8; 1];
            stream.read_exact(&mut first).await.unwrap();
            assert_eq!(first[0], RAFT_RPC);
            layer.accept(stream).await;
        });

        let sender_addr = "127.0.0.1:0".to_string();
        let (sender, _sender_layer, _rx) = Transport::new("node-a".into(), sender_addr);
        sender
            .send(
                &addr,
                RaftMessage::RequestVote {
                    term: 1,
                    candidate_id: "node-a".into(),
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
            .await;

        let envelope = tokio::time::timeout(Duration::from_secs(2), delivery.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.from_id, "node-a");
        assert!(matches!(envelope.msg, RaftMessage::RequestVote { term: 1, .. }));
        drop(transport);
    }

    #[tokio::test]
    async fn send_to_unreachable_peer_does_not_block() {
        let (transport, _layer, _rx) =
            Transport::new("node-a".into(), "127.0.0.1:0".into());
        // Nothing is listening on this port; the send must return.
        transport
            .send(
                "127.0.0.1:1",
                RaftMessage::RequestVoteResponse {
                    term: 1,
                    vote_granted: false,
                },
            )
            .await;
    }
}
