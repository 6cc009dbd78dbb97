//! MowGrass Sync Server
//!
//! Hosts the lobby and pushes authoritative session state to clients.
//! Configuration comes from `MOWGRASS_*` environment variables; command line
//! flags take precedence.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mowgrass::{GameServer, ServerConfig, VERSION};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// IP address to bind to
    #[arg(short = 'H', long)]
    host: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// State broadcast period in milliseconds
    #[arg(long)]
    period_ms: Option<u64>,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) {
        let host = self.host.unwrap_or_else(|| config.bind_addr.ip());
        let port = self.port.unwrap_or_else(|| config.bind_addr.port());
        config.bind_addr = SocketAddr::new(host, port);

        if let Some(ms) = self.period_ms.filter(|ms| *ms > 0) {
            config.broadcast_period = Duration::from_millis(ms);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let args = Args::parse();
    let mut config = ServerConfig::from_env();
    args.apply(&mut config);

    info!("MowGrass Server v{}", VERSION);
    info!("Broadcast period: {:?}", config.broadcast_period);
    info!("Max connections: {}", config.max_connections);

    let server = GameServer::new(config);

    tokio::select! {
        result = server.run() => {
            result.context("Server stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            server.shutdown();
        }
    }

    Ok(())
}
