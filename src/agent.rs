//! Join agent: the client side of the admission protocol
//!
//! Generates a local keypair, asks the coordinator for an address, and
//! materializes the returned assignment as a WireGuard config file the host
//! tooling can bring up. One attempt per invocation; retry policy belongs to
//! the caller.

use std::fs;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use tracing::info;

use crate::error::{Error, Result};
use crate::keys::KeyPair;
use crate::server::{JoinRequest, JoinResponse};

/// Parameters for one join attempt
#[derive(Debug, Clone)]
pub struct JoinOptions {
    /// Full URL of the coordinator's join endpoint
    pub endpoint: String,
    /// Shared admission token
    pub token: String,
    /// Name for the local tunnel interface
    pub interface: String,
    /// Allowed-IPs policy for the coordinator peer block
    pub allowed_ips: Vec<Ipv4Net>,
    /// PersistentKeepalive interval in seconds
    pub keepalive: u16,
    /// Directory the config file is written into
    pub output_dir: PathBuf,
}

/// Join the mesh: request an address and write `<interface>.conf`.
///
/// Returns the path of the written config file.
pub async fn join(opts: &JoinOptions) -> Result<PathBuf> {
    let keypair = KeyPair::generate();
    info!(public_key = %keypair.public_base64(), "generated local keypair");

    let client = reqwest::Client::new();
    let response = client
        .post(&opts.endpoint)
        .header("X-Token", &opts.token)
        .json(&JoinRequest {
            public_key: keypair.public_base64(),
        })
        .send()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Server {
            status: status.as_u16(),
            body,
        });
    }

    let joined: JoinResponse = response
        .json()
        .await
        .map_err(|e| Error::Network(format!("invalid response body: {e}")))?;
    info!(assigned_ip = %joined.assigned_ip, peers = joined.peers.len(), "joined mesh");

    let content = render_config(&keypair, &joined, &opts.allowed_ips, opts.keepalive);
    let path = opts.output_dir.join(format!("{}.conf", opts.interface));
    write_config(&path, &content)?;
    info!(path = %path.display(), "wrote tunnel config");

    print_summary(&joined, &path);
    Ok(path)
}

/// Render the local tunnel config for an accepted join.
///
/// The coordinator gets the caller's allowed-IPs policy and a keepalive so
/// NAT mappings stay warm; every other returned peer gets its own /32 for
/// direct mesh reachability. Our own entry in the peer list is skipped.
pub fn render_config(
    keypair: &KeyPair,
    joined: &JoinResponse,
    allowed_ips: &[Ipv4Net],
    keepalive: u16,
) -> String {
    let own_key = keypair.public_base64();
    let policy = allowed_ips
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    let mut out = String::new();
    out.push_str("[Interface]\n");
    out.push_str(&format!("PrivateKey = {}\n", keypair.private_base64()));
    out.push_str(&format!("Address = {}\n", joined.assigned_ip));

    out.push_str("\n[Peer]\n");
    out.push_str(&format!("PublicKey = {}\n", joined.server_public_key));
    out.push_str(&format!("AllowedIPs = {}\n", policy));
    out.push_str(&format!("PersistentKeepalive = {}\n", keepalive));

    for peer in &joined.peers {
        if peer.public_key == own_key {
            continue;
        }
        out.push_str("\n[Peer]\n");
        out.push_str(&format!("PublicKey = {}\n", peer.public_key));
        out.push_str(&format!("AllowedIPs = {}\n", peer.allowed_ip));
    }

    out
}

fn write_config(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    // The file carries the private key.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn print_summary(joined: &JoinResponse, path: &Path) {
    println!("Joined mesh network");
    println!("  assigned address : {}", joined.assigned_ip);
    println!("  coordinator key  : {}", joined.server_public_key);
    println!("  known peers      : {}", joined.peers.len());
    println!("  config written to: {}", path.display());
}
