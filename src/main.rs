//! wgmeshd - WireGuard mesh coordinator daemon
//!
//! Owns the tunnel interface, allocates addresses, and serves the join API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ipnet::Ipv4Net;
use tokio::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wgmesh::device::{InterfaceController, WgDevice};
use wgmesh::error::Result;
use wgmesh::server::{self, AppState};
use wgmesh::store::MembershipSnapshot;

/// WireGuard mesh coordinator
#[derive(Parser)]
#[command(name = "wgmeshd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// WireGuard interface name
    #[arg(long, default_value = "wg0")]
    iface: String,

    /// Mesh subnet addresses are allocated from
    #[arg(long, default_value = "10.0.0.0/24")]
    subnet: Ipv4Net,

    /// WireGuard UDP listen port
    #[arg(long, default_value_t = 51820)]
    listen_port: u16,

    /// Address the join API binds to
    #[arg(long, default_value = "0.0.0.0:8080")]
    api_addr: String,

    /// Shared admission token (required)
    #[arg(long)]
    token: String,

    /// Directory holding the interface config file
    #[arg(long, default_value = "/etc/wireguard")]
    config_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let controller = InterfaceController::new(Arc::new(WgDevice::new()));
    let config_path = cli.config_dir.join(format!("{}.conf", cli.iface));

    let snapshot = bootstrap(&controller, &config_path, &cli)?;
    tracing::info!(
        interface = %snapshot.identity.name,
        subnet = %snapshot.identity.subnet,
        peers = snapshot.peers.len(),
        "coordinator ready"
    );

    let state = Arc::new(AppState {
        token: cli.token,
        config_path,
        controller,
        snapshot: Mutex::new(snapshot),
    });
    server::serve(state, &cli.api_addr).await
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

/// Load the persisted membership or bootstrap a fresh interface, then
/// reconcile the live device against it.
fn bootstrap(
    controller: &InterfaceController,
    config_path: &std::path::Path,
    cli: &Cli,
) -> Result<MembershipSnapshot> {
    match MembershipSnapshot::load(config_path, &cli.iface) {
        Ok(snapshot) => {
            tracing::info!(
                path = %config_path.display(),
                peers = snapshot.peers.len(),
                "loaded existing membership config"
            );
            // The persisted identity wins over flags; flags that disagree
            // are a likely operator mistake worth flagging.
            if snapshot.identity.subnet != cli.subnet {
                tracing::warn!(
                    flag = %cli.subnet,
                    persisted = %snapshot.identity.subnet,
                    "subnet flag differs from persisted config; using persisted subnet"
                );
            }
            if snapshot.identity.listen_port != cli.listen_port {
                tracing::warn!(
                    flag = cli.listen_port,
                    persisted = snapshot.identity.listen_port,
                    "listen-port flag differs from persisted config; using persisted port"
                );
            }

            if controller.ensure_device(&snapshot.identity)? {
                tracing::info!(interface = %cli.iface, "recreated tunnel interface from persisted identity");
            }
            // Re-apply every persisted peer so the device matches the file
            // even after an unclean shutdown; application is idempotent.
            for peer in &snapshot.peers {
                controller.apply_peer(&snapshot.identity.name, peer)?;
            }
            Ok(snapshot)
        }
        Err(e) if e.is_not_found() => {
            tracing::info!(
                path = %config_path.display(),
                interface = %cli.iface,
                "no membership config found, bootstrapping interface"
            );
            let identity =
                controller.discover_or_create(&cli.iface, cli.subnet, cli.listen_port)?;
            let snapshot = MembershipSnapshot::new(identity);
            snapshot.save(config_path)?;
            Ok(snapshot)
        }
        Err(e) => {
            tracing::error!(path = %config_path.display(), "failed to load membership config: {e}");
            Err(e)
        }
    }
}
