//! Single-port connection mux.
//!
//! Consensus traffic and gRPC share the node's one TCP listener. Outbound
//! consensus dials write a single discriminator byte before any data, so
//! the accept loop peeks the first byte of each connection: the
//! discriminator routes to the raft stream layer (with the byte consumed),
//! anything else is handed to tonic untouched.

use std::io;

use driftlog_raft::{StreamLayer, RAFT_RPC};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Run the accept loop until `shutdown` flips. gRPC connections flow out
/// through `grpc_tx` to `serve_with_incoming`.
pub async fn run(
    listener: TcpListener,
    raft: StreamLayer,
    grpc_tx: mpsc::Sender<io::Result<TcpStream>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let raft = raft.clone();
                        let grpc_tx = grpc_tx.clone();
                        tokio::spawn(route(stream, raft, grpc_tx));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("mux shutting down");
                    return;
                }
            }
        }
    }
}

async fn route(stream: TcpStream, raft: StreamLayer, grpc_tx: mpsc::Sender<io::Result<TcpStream>>) {
    let mut first = [0u8; 1];
    match stream.peek(&mut first).await {
        Ok(0) | Err(_) => return, // closed before sending anything
        Ok(_) => {}
    }

    if first[0] == RAFT_RPC {
        let mut stream = stream;
        if stream.read_exact(&mut first).await.is_err() {
            return;
        }
        raft.accept(stream).await;
    } else if grpc_tx.send(Ok(stream)).await.is_err() {
        debug!("grpc server gone, dropping connection");
    }
}
