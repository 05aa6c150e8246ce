//! Burrow relay server
//!
//! Publishes local services run behind an agent under `<id>.<domain>`: agents create a tunnel
//! over the HTTP API, dial back into the tunnel's port, and public requests are relayed
//! through those sockets.

use anyhow::{Context, Result};
use burrow_lib::{
    HttpServerConfig, PoolConfig, RegistryConfig, Relay, RelayConfig, DEFAULT_LANDING_PAGE,
};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Reverse-tunnel relay - accepts public HTTP and routes it to tunnel agents
#[derive(Parser, Debug)]
#[command(name = "burrow-relay")]
#[command(about = "Run a burrow reverse-tunnel relay", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Address the public HTTP listener binds
    #[arg(long, env = "BURROW_ADDRESS", default_value = "0.0.0.0")]
    address: IpAddr,

    /// Public HTTP port
    #[arg(long, env = "BURROW_PORT", default_value = "80")]
    port: u16,

    /// Base domain tunnels are served under (e.g., "tunnel.example.com")
    /// Tunnels are reachable as {id}.{domain}. When unset, the registrable domain of
    /// the Host header (per the public suffix list) is treated as the base domain.
    #[arg(long, env = "BURROW_DOMAIN")]
    domain: Option<String>,

    /// Advertise https:// tunnel URLs (TLS terminated in front of the relay)
    #[arg(long, env = "BURROW_SECURE")]
    secure: bool,

    /// Maximum idle reverse sockets kept per tunnel
    #[arg(long, env = "BURROW_MAX_SOCKETS", default_value = "10")]
    max_sockets: usize,

    /// Maximum live tunnels a single client address may hold
    #[arg(long, env = "BURROW_MAX_TUNNELS_PER_IP", default_value = "5")]
    max_tunnels_per_ip: usize,

    /// Where requests to the bare domain are redirected
    #[arg(long, env = "BURROW_LANDING", default_value = DEFAULT_LANDING_PAGE)]
    landing: String,

    /// Seconds a public request waits for a free reverse socket
    #[arg(long, env = "BURROW_ACQUIRE_TIMEOUT_SECS", default_value = "30")]
    acquire_timeout_secs: u64,

    /// Seconds an idle reverse socket is kept before it is presumed dead
    #[arg(long, env = "BURROW_IDLE_TIMEOUT_SECS", default_value = "300")]
    idle_timeout_secs: u64,

    /// Seconds a tunnel may go without any reverse socket before it is closed
    #[arg(long, env = "BURROW_OFFLINE_GRACE_SECS", default_value = "5")]
    offline_grace_secs: u64,

    /// Address per-tunnel reverse connection listeners bind
    #[arg(long, env = "BURROW_TUNNEL_BIND_ADDRESS", default_value = "0.0.0.0")]
    tunnel_bind_address: IpAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "BURROW_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            http: HttpServerConfig {
                bind_addr: SocketAddr::new(self.address, self.port),
                ..HttpServerConfig::default()
            },
            registry: RegistryConfig {
                max_sessions_per_source: self.max_tunnels_per_ip,
                pool: PoolConfig {
                    capacity: self.max_sockets,
                    bind_ip: self.tunnel_bind_address,
                    idle_timeout: Duration::from_secs(self.idle_timeout_secs),
                },
                acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
                offline_grace: Duration::from_secs(self.offline_grace_secs),
            },
            domain: self.domain.clone(),
            secure: self.secure,
            landing_page: self.landing.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    info!("🚀 Starting burrow relay {}", env!("GIT_TAG"));
    match &cli.domain {
        Some(domain) => info!("Tunnels served as <id>.{}", domain),
        None => info!("No base domain configured, deriving it from the Host header"),
    }

    let relay = Relay::bind(cli.relay_config())
        .await
        .context("Failed to start relay")?;
    info!("✅ Public HTTP listening on {}", relay.local_addr()?);
    info!("Press Ctrl+C to stop");

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(relay.run(shutdown.clone()));

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping relay..."),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }
    shutdown.cancel();

    server.await.context("Relay task panicked")??;
    info!("✅ Burrow relay stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
