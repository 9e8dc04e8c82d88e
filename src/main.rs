use clap::Parser;
use std::net::SocketAddr;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use taskmesh::config::SchedulerConfig;
use taskmesh::node::SchedulerNode;

#[derive(Parser, Debug)]
#[command(name = "taskmesh")]
#[command(about = "A centralized dynamic task scheduler with data dependencies")]
struct Args {
    /// Port to listen on for worker and client streams
    #[arg(long, default_value = "8786")]
    port: u16,

    /// Port for the diagnostics dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Expected interval between worker heartbeats, in milliseconds
    #[arg(long, default_value = "500")]
    heartbeat_interval_ms: u64,

    /// Consecutive missed heartbeats before a worker is evicted
    #[arg(long, default_value = "3")]
    heartbeat_misses: u32,

    /// Worker failures a task may be involved in before it is quarantined
    #[arg(long, default_value = "3")]
    suspicion_limit: u32,

    /// Assumed network bandwidth for placement decisions, in bytes/sec
    #[arg(long, default_value = "100000000")]
    bandwidth: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let config = SchedulerConfig {
        listen_addr,
        dashboard_addr,
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        heartbeat_misses: args.heartbeat_misses,
        suspicion_limit: args.suspicion_limit,
        bandwidth_bytes_per_sec: args.bandwidth,
        ..Default::default()
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        dashboard_addr = ?config.dashboard_addr,
        suspicion_limit = config.suspicion_limit,
        "Starting taskmesh scheduler"
    );

    // The scheduler keeps no persistent state, so shutdown is just a
    // cancellation: every loop and server watches this token and drains.
    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let token = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("Terminated, shutting down");
            }
        }
        token.cancel();
    });

    let (node, events_rx) = SchedulerNode::new(config);
    node.run(events_rx, shutdown).await?;

    Ok(())
}
