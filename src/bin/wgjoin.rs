//! wgjoin - Join an existing WireGuard mesh
//!
//! Generates a keypair, requests admission from a wgmeshd coordinator, and
//! writes the resulting `<iface>.conf` into the output directory.

use std::path::PathBuf;

use clap::Parser;
use ipnet::Ipv4Net;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wgmesh::agent::{self, JoinOptions};
use wgmesh::error::Result;

/// WireGuard mesh join agent
#[derive(Parser)]
#[command(name = "wgjoin")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Full URL of the coordinator's join endpoint
    /// (e.g. http://192.168.33.10:8080/join)
    #[arg(long)]
    server: String,

    /// Shared admission token
    #[arg(long)]
    token: String,

    /// Name for the local tunnel interface
    #[arg(long, default_value = "wg0")]
    iface: String,

    /// Allowed-IPs policy for the coordinator peer, comma separated
    #[arg(long, value_delimiter = ',', default_value = "0.0.0.0/0")]
    allowed: Vec<Ipv4Net>,

    /// PersistentKeepalive interval in seconds
    #[arg(long, default_value_t = 25)]
    keepalive: u16,

    /// Directory the config file is written into
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let opts = JoinOptions {
        endpoint: cli.server,
        token: cli.token,
        interface: cli.iface,
        allowed_ips: cli.allowed,
        keepalive: cli.keepalive,
        output_dir: cli.output_dir,
    };

    match agent::join(&opts).await {
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::error!("join failed: {e}");
            Err(e)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
