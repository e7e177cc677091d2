//! Durable membership records for a mesh interface
//!
//! The coordinator persists interface identity and the admitted peer list as
//! a standard WireGuard configuration file: an `[Interface]` section followed
//! by one `[Peer]` section per admitted node. The format is line-oriented and
//! human-editable; blank lines, `#` comments, and unknown keys are ignored on
//! load so hand edits and newer fields survive a round trip.
//!
//! Saving always rewrites the whole file through a temp-file-plus-rename, so
//! a crash mid-write never leaves a truncated config behind. There is no
//! append path: callers mutate the in-memory snapshot and save it as a unit,
//! under the join critical section.

use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::Ipv4Net;
use tracing::{debug, warn};
use x25519_dalek::PublicKey;

use crate::error::{Error, Result};
use crate::keys::{self, KeyPair};

/// Identity of the coordinator's tunnel interface.
///
/// Created once when the interface is first discovered or created and
/// immutable afterwards. The private key stays inside this process.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceIdentity {
    /// Interface name, e.g. "wg0"
    pub name: String,
    /// The interface keypair
    pub keypair: KeyPair,
    /// WireGuard UDP listen port
    pub listen_port: u16,
    /// The mesh subnet addresses are allocated from
    pub subnet: Ipv4Net,
}

/// One admitted peer: public key plus its assigned host address.
///
/// Records are append-only; a peer is never removed or reassigned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerRecord {
    pub public_key: PublicKey,
    pub address: Ipv4Addr,
}

/// Interface identity plus the ordered peer list — the unit of persistence
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipSnapshot {
    pub identity: InterfaceIdentity,
    pub peers: Vec<PeerRecord>,
}

enum Section {
    None,
    Interface,
    Peer,
}

#[derive(Default)]
struct PeerDraft {
    public_key: Option<PublicKey>,
    address: Option<Ipv4Addr>,
    malformed: bool,
}

fn flush_peer(draft: Option<PeerDraft>, peers: &mut Vec<PeerRecord>) {
    let Some(draft) = draft else { return };
    match (draft.public_key, draft.address, draft.malformed) {
        (Some(public_key), Some(address), false) => {
            peers.push(PeerRecord {
                public_key,
                address,
            });
        }
        _ => warn!("skipping incomplete or malformed [Peer] block in membership config"),
    }
}

impl MembershipSnapshot {
    /// Create a fresh snapshot with no peers
    pub fn new(identity: InterfaceIdentity) -> Self {
        Self {
            identity,
            peers: Vec::new(),
        }
    }

    /// Load a snapshot from a WireGuard config file.
    ///
    /// A missing file surfaces as `Error::Io` with `NotFound` (check with
    /// [`Error::is_not_found`]); a broken `[Interface]` section is
    /// `Error::ConfigCorrupt`. Malformed `[Peer]` blocks are skipped with a
    /// diagnostic rather than failing the whole load.
    pub fn load(path: &Path, interface: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let snapshot = Self::parse(&content, interface)?;
        debug!(
            path = %path.display(),
            peers = snapshot.peers.len(),
            "loaded membership config"
        );
        Ok(snapshot)
    }

    /// Parse the config grammar from a string
    pub fn parse(content: &str, interface: &str) -> Result<Self> {
        let mut section = Section::None;
        let mut private_key = None;
        let mut subnet: Option<Ipv4Net> = None;
        let mut listen_port: Option<u16> = None;
        let mut peers = Vec::new();
        let mut draft: Option<PeerDraft> = None;

        for raw in content.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match line {
                "[Interface]" => {
                    flush_peer(draft.take(), &mut peers);
                    section = Section::Interface;
                }
                "[Peer]" => {
                    flush_peer(draft.take(), &mut peers);
                    section = Section::Peer;
                    draft = Some(PeerDraft::default());
                }
                _ => {
                    let Some((key, value)) = line.split_once('=') else {
                        continue;
                    };
                    let (key, value) = (key.trim(), value.trim());

                    match section {
                        Section::Interface => match key {
                            "PrivateKey" => {
                                private_key =
                                    Some(keys::parse_private_key(value).map_err(|e| {
                                        Error::ConfigCorrupt(format!("bad PrivateKey: {e}"))
                                    })?);
                            }
                            "Address" => {
                                subnet = Some(value.parse().map_err(|e| {
                                    Error::ConfigCorrupt(format!("bad Address '{value}': {e}"))
                                })?);
                            }
                            "ListenPort" => {
                                listen_port = Some(value.parse().map_err(|e| {
                                    Error::ConfigCorrupt(format!("bad ListenPort '{value}': {e}"))
                                })?);
                            }
                            // Unknown keys are ignored for forward compatibility
                            _ => {}
                        },
                        Section::Peer => {
                            let Some(d) = draft.as_mut() else { continue };
                            match key {
                                "PublicKey" => match keys::parse_public_key(value) {
                                    Ok(pk) => d.public_key = Some(pk),
                                    Err(e) => {
                                        warn!("bad peer PublicKey: {e}");
                                        d.malformed = true;
                                    }
                                },
                                "AllowedIPs" => match value.parse::<Ipv4Net>() {
                                    Ok(net) => d.address = Some(net.addr()),
                                    Err(e) => {
                                        warn!("bad peer AllowedIPs '{value}': {e}");
                                        d.malformed = true;
                                    }
                                },
                                _ => {}
                            }
                        }
                        Section::None => {}
                    }
                }
            }
        }
        flush_peer(draft.take(), &mut peers);

        let secret = private_key
            .ok_or_else(|| Error::ConfigCorrupt("missing PrivateKey in [Interface]".into()))?;
        let subnet = subnet
            .ok_or_else(|| Error::ConfigCorrupt("missing Address in [Interface]".into()))?;
        let listen_port = listen_port
            .ok_or_else(|| Error::ConfigCorrupt("missing ListenPort in [Interface]".into()))?;

        let public = PublicKey::from(&secret);
        Ok(Self {
            identity: InterfaceIdentity {
                name: interface.to_string(),
                keypair: KeyPair { secret, public },
                listen_port,
                subnet,
            },
            peers,
        })
    }

    /// Render the snapshot in the config grammar
    pub fn render(&self) -> String {
        let id = &self.identity;
        let mut out = String::new();
        out.push_str("[Interface]\n");
        out.push_str(&format!("PrivateKey = {}\n", id.keypair.private_base64()));
        out.push_str(&format!("Address = {}\n", id.subnet));
        out.push_str(&format!("ListenPort = {}\n", id.listen_port));
        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            out.push_str(&format!(
                "PublicKey = {}\n",
                keys::public_key_base64(&peer.public_key)
            ));
            out.push_str(&format!("AllowedIPs = {}/32\n", peer.address));
        }
        out
    }

    /// Atomically rewrite the whole config file.
    ///
    /// Writes a sibling temp file first and then renames it over the
    /// target, so a crash can never leave a partially-written config. The
    /// file holds the interface private key, so permissions are owner-only.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("conf.tmp");
        fs::write(&tmp, self.render())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), peers = self.peers.len(), "saved membership config");
        Ok(())
    }

    /// Find the record for a peer public key, if admitted before
    pub fn find_peer(&self, public_key: &PublicKey) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.public_key == *public_key)
    }

    /// The set of addresses allocation must avoid: every peer's address,
    /// plus the interface's own host address when the subnet was given in
    /// host form (e.g. "10.0.0.1/24").
    pub fn taken_addresses(&self) -> HashSet<Ipv4Addr> {
        let mut taken: HashSet<Ipv4Addr> = self.peers.iter().map(|p| p.address).collect();
        let own = self.identity.subnet.addr();
        if own != self.identity.subnet.network() {
            taken.insert(own);
        }
        taken
    }
}
