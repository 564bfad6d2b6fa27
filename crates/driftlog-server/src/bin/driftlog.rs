//! driftlog server binary.
//!
//! ```bash
//! # Bootstrap a single-node cluster
//! driftlog --node-name node-0 --data-dir ./data/node-0 \
//!     --rpc-addr 127.0.0.1:8400 --bind-addr 127.0.0.1:8401 --bootstrap
//!
//! # Join a second node through the first node's gossip address
//! driftlog --node-name node-1 --data-dir ./data/node-1 \
//!     --rpc-addr 127.0.0.1:8410 --bind-addr 127.0.0.1:8411 \
//!     --join 127.0.0.1:8401
//! ```

use std::path::PathBuf;

use clap::Parser;
use driftlog_server::{Agent, AgentConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "driftlog", about = "A distributed, replicated commit log")]
struct Cli {
    /// Directory for log segments and consensus state.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Unique node name.
    #[arg(long)]
    node_name: String,

    /// UDP address for membership gossip.
    #[arg(long, default_value = "127.0.0.1:8401")]
    bind_addr: String,

    /// TCP address serving gRPC and consensus traffic.
    #[arg(long, default_value = "127.0.0.1:8400")]
    rpc_addr: String,

    /// Gossip address of an existing member; repeatable.
    #[arg(long = "join")]
    start_join_addrs: Vec<String>,

    /// Bootstrap a fresh single-node cluster.
    #[arg(long)]
    bootstrap: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AgentConfig::new(cli.node_name);
    config.data_dir = cli.data_dir;
    config.bind_addr = cli.bind_addr;
    config.rpc_addr = cli.rpc_addr;
    config.start_join_addrs = cli.start_join_addrs;
    config.bootstrap = cli.bootstrap;

    let agent = Agent::new(config).await?;
    info!(rpc = %agent.rpc_addr(), gossip = %agent.gossip_addr(), "serving");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    agent.shutdown().await?;
    Ok(())
}
