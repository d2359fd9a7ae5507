//! Standalone topic tracker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use swarmchat_core::adapters::quic::tracker::TrackerServer;

/// Topic tracker that swarmchat peers announce to and look each other up from.
#[derive(Debug, Parser)]
#[command(name = "swarmchat-tracker", version)]
struct Args {
    /// Address to accept QUIC connections on.
    #[arg(long, default_value = "0.0.0.0:4433")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(addr = %args.listen, "Tracker starting");
    let server = Arc::new(TrackerServer::bind(args.listen)?);

    tokio::select! {
        result = Arc::clone(&server).run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            server.close();
            Ok(())
        }
    }
}
