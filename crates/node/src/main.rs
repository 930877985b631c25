use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use weft_node::{Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "weft-node", about = "weft storage and compute node")]
struct Args {
    /// Node identifier; selects the config directory.
    #[arg(long, default_value = "default")]
    node_id: String,

    /// Overlay port for TCP and QUIC (0 = ephemeral).
    #[arg(long)]
    port: Option<u16>,

    /// Loopback-only mode: no DHT, no NAT traversal.
    #[arg(long)]
    local: bool,

    /// Bootstrap peer multiaddrs, repeatable.
    #[arg(long = "bootstrap")]
    bootstrap: Vec<String>,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Override the state directory (default: user config dir).
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run(Args::parse()).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            error!("startup failed: {err:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => NodeConfig::default_dir(&args.node_id)?,
    };

    let mut config = NodeConfig::load_or_default(&args.node_id, &data_dir)?;
    if let Some(port) = args.port {
        config.overlay_port = port;
    }
    if args.local {
        config.local_mode = true;
    }
    for addr in args.bootstrap {
        if !config.bootstrap_peers.contains(&addr) {
            config.bootstrap_peers.push(addr);
        }
    }
    config.save(&data_dir)?;

    if let Some(addr) = args.metrics_addr {
        tokio::spawn(async move {
            if let Err(err) = weft_metrics::exporter::serve(addr).await {
                error!(%err, "metrics exporter stopped");
            }
        });
    }

    let node = Node::start(config, data_dir).await?;

    tokio::signal::ctrl_c().await?;
    info!("termination signal received");
    node.shutdown().await;
    Ok(())
}
