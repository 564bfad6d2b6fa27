//! Membership gossip.
//!
//! Nodes discover each other over a small UDP heartbeat protocol: every
//! interval a node sends its identity and known member list to its peers
//! (and, until acknowledged, to the configured join addresses). A remote
//! node seen for the first time produces a join event; a node that stops
//! heartbeating past the failure timeout, or announces itself as leaving,
//! produces a leave event.
//!
//! Events are bridged to a [`MembershipHandler`], in production the
//! replicated log's `join`/`leave`. Handler failures never crash the
//! process; `NotLeader` is logged at debug because only the leader can
//! change the cluster configuration and the leader's own bridge will see
//! the same event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;

const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_TIMEOUT: Duration = Duration::from_secs(3);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const CLUSTER_TAG: &str = "driftlog";
const MAX_DATAGRAM: usize = 64 * 1024;

/// Consumer of membership events.
#[async_trait]
pub trait MembershipHandler: Send + Sync + 'static {
    async fn join(&self, name: &str, rpc_addr: &str) -> driftlog_raft::Result<()>;
    async fn leave(&self, name: &str) -> driftlog_raft::Result<()>;
}

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// This node's unique name.
    pub node_name: String,
    /// UDP address the gossip socket binds to.
    pub bind_addr: String,
    /// RPC address advertised to peers.
    pub rpc_addr: String,
    /// Gossip addresses of existing cluster members to announce to.
    pub start_join_addrs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Heartbeat {
    cluster: String,
    name: String,
    rpc_addr: String,
    gossip_addr: String,
    leaving: bool,
    /// The sender's view of the cluster, so membership spreads without
    /// every node being listed in everyone's join addresses.
    members: Vec<MemberInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemberInfo {
    name: String,
    rpc_addr: String,
    gossip_addr: String,
}

struct MemberState {
    rpc_addr: String,
    gossip_addr: String,
    last_seen: Instant,
}

pub struct Membership {
    config: MembershipConfig,
    socket: Arc<UdpSocket>,
    gossip_addr: String,
    members: Arc<RwLock<HashMap<String, MemberState>>>,
    handler: Arc<dyn MembershipHandler>,
    shutdown_tx: watch::Sender<bool>,
}

impl Membership {
    /// Bind the gossip socket and start the heartbeat, receive, and sweep
    /// tasks.
    pub async fn start(
        config: MembershipConfig,
        handler: Arc<dyn MembershipHandler>,
    ) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        let gossip_addr = socket.local_addr()?.to_string();
        let members = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(name = %config.node_name, gossip = %gossip_addr, "membership started");

        let membership = Self {
            config,
            socket,
            gossip_addr,
            members,
            handler,
            shutdown_tx,
        };
        membership.spawn_heartbeat(shutdown_rx.clone());
        membership.spawn_receiver(shutdown_rx.clone());
        membership.spawn_sweeper(shutdown_rx);
        Ok(membership)
    }

    /// The bound gossip address; peers put this in their join lists.
    pub fn gossip_addr(&self) -> &str {
        &self.gossip_addr
    }

    /// Names and RPC addresses of every known member, including the local
    /// node.
    pub async fn members(&self) -> Vec<(String, String)> {
        let mut out = vec![(
            self.config.node_name.clone(),
            self.config.rpc_addr.clone(),
        )];
        let members = self.members.read().await;
        out.extend(
            members
                .iter()
                .map(|(name, m)| (name.clone(), m.rpc_addr.clone())),
        );
        out
    }

    /// Announce departure to every known peer and stop the gossip tasks.
    pub async fn leave(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        let beat = self.heartbeat(true).await;
        let frame = serde_json::to_vec(&beat)?;

        let members = self.members.read().await;
        for member in members.values() {
            let _ = self.socket.send_to(&frame, &member.gossip_addr).await;
        }
        info!(name = %self.config.node_name, "membership left");
        Ok(())
    }

    async fn heartbeat(&self, leaving: bool) -> Heartbeat {
        let members = self.members.read().await;
        Heartbeat {
            cluster: CLUSTER_TAG.to_string(),
            name: self.config.node_name.clone(),
            rpc_addr: self.config.rpc_addr.clone(),
            gossip_addr: self.gossip_addr.clone(),
            leaving,
            members: members
                .iter()
                .map(|(name, m)| MemberInfo {
                    name: name.clone(),
                    rpc_addr: m.rpc_addr.clone(),
                    gossip_addr: m.gossip_addr.clone(),
                })
                .collect(),
        }
    }

    fn spawn_heartbeat(&self, mut shutdown: watch::Receiver<bool>) {
        let socket = self.socket.clone();
        let members = self.members.clone();
        let config = self.config.clone();
        let gossip_addr = self.gossip_addr.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() { return; }
                    }
                }

                let beat = {
                    let members = members.read().await;
                    Heartbeat {
                        cluster: CLUSTER_TAG.to_string(),
                        name: config.node_name.clone(),
                        rpc_addr: config.rpc_addr.clone(),
                        gossip_addr: gossip_addr.clone(),
                        leaving: false,
                        members: members
                            .iter()
                            .map(|(name, m)| MemberInfo {
                                name: name.clone(),
                                rpc_addr: m.rpc_addr.clone(),
                                gossip_addr: m.gossip_addr.clone(),
                            })
                            .collect(),
                    }
                };
                let frame = match serde_json::to_vec(&beat) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(error = %e, "failed to encode heartbeat");
                        continue;
                    }
                };

                let mut targets: Vec<String> = config.start_join_addrs.clone();
                {
                    let members = members.read().await;
                    targets.extend(members.values().map(|m| m.gossip_addr.clone()));
                }
                targets.sort();
                targets.dedup();
                for target in targets {
                    if target == gossip_addr {
                        continue;
                    }
                    if let Err(e) = socket.send_to(&frame, &target).await {
                        debug!(target = %target, error = %e, "heartbeat send failed");
                    }
                }
            }
        });
    }

    fn spawn_receiver(&self, mut shutdown: watch::Receiver<bool>) {
        let socket = self.socket.clone();
        let members = self.members.clone();
        let handler = self.handler.clone();
        let local_name = self.config.node_name.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let n = tokio::select! {
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((n, _)) => n,
                        Err(e) => {
                            warn!(error = %e, "gossip receive failed");
                            continue;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() { return; }
                        continue;
                    }
                };

                let beat: Heartbeat = match serde_json::from_slice(&buf[..n]) {
                    Ok(beat) => beat,
                    Err(e) => {
                        debug!(error = %e, "dropping undecodable gossip datagram");
                        continue;
                    }
                };
                if beat.cluster != CLUSTER_TAG {
                    continue;
                }

                // The sender itself, plus everything it knows about.
                let mut seen = vec![MemberInfo {
                    name: beat.name.clone(),
                    rpc_addr: beat.rpc_addr.clone(),
                    gossip_addr: beat.gossip_addr.clone(),
                }];
                seen.extend(beat.members);

                if beat.leaving {
                    handle_leave(&members, &handler, &beat.name).await;
                    continue;
                }

                for info in seen {
                    if info.name == local_name {
                        continue;
                    }
                    handle_join(&members, &handler, info, &beat.name).await;
                }
            }
        });
    }

    fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let members = self.members.clone();
        let handler = self.handler.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() { return; }
                    }
                }

                let now = Instant::now();
                let expired: Vec<String> = {
                    let members = members.read().await;
                    members
                        .iter()
                        .filter(|(_, m)| now.duration_since(m.last_seen) > FAILURE_TIMEOUT)
                        .map(|(name, _)| name.clone())
                        .collect()
                };
                for name in expired {
                    info!(name = %name, "member failed");
                    handle_leave(&members, &handler, &name).await;
                }
            }
        });
    }
}

async fn handle_join(
    members: &Arc<RwLock<HashMap<String, MemberState>>>,
    handler: &Arc<dyn MembershipHandler>,
    info: MemberInfo,
    via: &str,
) {
    let is_new = {
        let mut members = members.write().await;
        match members.get_mut(&info.name) {
            Some(state) => {
                // Only direct heartbeats refresh liveness; relayed entries
                // just keep addresses current.
                if via == info.name {
                    state.last_seen = Instant::now();
                }
                state.rpc_addr = info.rpc_addr.clone();
                state.gossip_addr = info.gossip_addr.clone();
                false
            }
            None => {
                members.insert(
                    info.name.clone(),
                    MemberState {
                        rpc_addr: info.rpc_addr.clone(),
                        gossip_addr: info.gossip_addr.clone(),
                        last_seen: Instant::now(),
                    },
                );
                true
            }
        }
    };

    if is_new {
        info!(name = %info.name, rpc_addr = %info.rpc_addr, "member joined");
        if let Err(e) = handler.join(&info.name, &info.rpc_addr).await {
            if e.is_not_leader() {
                debug!(name = %info.name, "join deferred to leader");
            } else {
                error!(name = %info.name, error = %e, "failed to handle join");
            }
        }
    }
}

async fn handle_leave(
    members: &Arc<RwLock<HashMap<String, MemberState>>>,
    handler: &Arc<dyn MembershipHandler>,
    name: &str,
) {
    let existed = members.write().await.remove(name).is_some();
    if !existed {
        return;
    }
    info!(name = %name, "member left");
    if let Err(e) = handler.leave(name).await {
        if e.is_not_leader() {
            debug!(name = %name, "leave deferred to leader");
        } else {
            error!(name = %name, error = %e, "failed to handle leave");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records events instead of driving consensus.
    struct RecordingHandler {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MembershipHandler for RecordingHandler {
        async fn join(&self, name: &str, rpc_addr: &str) -> driftlog_raft::Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("join:{}:{}", name, rpc_addr));
            Ok(())
        }

        async fn leave(&self, name: &str) -> driftlog_raft::Result<()> {
            self.events.lock().unwrap().push(format!("leave:{}", name));
            Ok(())
        }
    }

    fn config(name: &str, join: Vec<String>) -> MembershipConfig {
        MembershipConfig {
            node_name: name.to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            rpc_addr: format!("127.0.0.1:9{}", name.len()),
            start_join_addrs: join,
        }
    }

    #[tokio::test]
    async fn two_nodes_discover_each_other() {
        let handler_a = Arc::new(RecordingHandler {
            events: Mutex::new(Vec::new()),
        });
        let handler_b = Arc::new(RecordingHandler {
            events: Mutex::new(Vec::new()),
        });

        let a = Membership::start(config("a", vec![]), handler_a.clone())
            .await
            .unwrap();
        let b = Membership::start(
            config("bb", vec![a.gossip_addr().to_string()]),
            handler_b.clone(),
        )
        .await
        .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let a_knows = a.members().await.len() == 2;
            let b_knows = b.members().await.len() == 2;
            if a_knows && b_knows {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "nodes never discovered each other"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(handler_a
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.starts_with("join:bb:")));
        assert!(handler_b
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.starts_with("join:a:")));

        // An explicit leave produces a leave event on the peer.
        b.leave().await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if handler_a.events.lock().unwrap().iter().any(|e| e == "leave:bb") {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "leave event never arrived"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        a.leave().await.unwrap();
    }
}
