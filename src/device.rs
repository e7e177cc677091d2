//! Tunnel device control for the coordinator
//!
//! The kernel owns the actual WireGuard device; this module wraps the small
//! set of operations the coordinator needs behind the [`DeviceControl`]
//! capability so the join path can be exercised against an in-memory device
//! in tests. The real implementation shells out to `ip` and `wg`, the same
//! way the interface tooling on the host does.
//!
//! Device failures are never retried here; each carries the operation and
//! device name so the caller can log and abort the request.

use std::io::Write as _;
use std::process::{Command, Stdio};
use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};
use crate::keys::{self, KeyPair};
use crate::store::{InterfaceIdentity, PeerRecord};

/// What the device layer reports about an existing tunnel interface
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub public_key: PublicKey,
    pub listen_port: u16,
}

/// The device-control capability: everything the coordinator asks of the
/// kernel tunnel subsystem. Constructed once and injected into
/// [`InterfaceController`].
pub trait DeviceControl: Send + Sync {
    /// Look up an existing device by name; `None` when absent
    fn get_device(&self, name: &str) -> Result<Option<DeviceInfo>>;

    /// Create a new tunnel device
    fn create_device(&self, name: &str) -> Result<()>;

    /// Assign the interface address
    fn assign_address(&self, name: &str, cidr: Ipv4Net) -> Result<()>;

    /// Set the private key and listen port
    fn configure_device(&self, name: &str, private_key: &StaticSecret, listen_port: u16)
        -> Result<()>;

    /// Bring the device administratively up
    fn set_link_up(&self, name: &str) -> Result<()>;

    /// Push one peer, replacing that peer's allowed-address set so
    /// re-application is idempotent
    fn apply_peer(&self, name: &str, public_key: &PublicKey, allowed_ip: Ipv4Net) -> Result<()>;
}

/// [`DeviceControl`] backed by the `ip` and `wg` command-line tools
pub struct WgDevice;

impl WgDevice {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, op: &'static str, device: &str, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::device(op, device, format!("failed to run {program}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::device(op, device, stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for WgDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceControl for WgDevice {
    fn get_device(&self, name: &str) -> Result<Option<DeviceInfo>> {
        let exists = Command::new("ip")
            .args(["link", "show", "dev", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| Error::device("discover", name, format!("failed to run ip: {e}")))?;
        if !exists.success() {
            return Ok(None);
        }

        let key_b64 = self.run("discover", name, "wg", &["show", name, "public-key"])?;
        let public_key = keys::parse_public_key(&key_b64)
            .map_err(|e| Error::device("discover", name, format!("bad public key: {e}")))?;
        let port = self.run("discover", name, "wg", &["show", name, "listen-port"])?;
        let listen_port = port
            .parse()
            .map_err(|_| Error::device("discover", name, format!("bad listen-port '{port}'")))?;

        Ok(Some(DeviceInfo {
            public_key,
            listen_port,
        }))
    }

    fn create_device(&self, name: &str) -> Result<()> {
        self.run("create", name, "ip", &["link", "add", name, "type", "wireguard"])?;
        Ok(())
    }

    fn assign_address(&self, name: &str, cidr: Ipv4Net) -> Result<()> {
        self.run(
            "assign-address",
            name,
            "ip",
            &["addr", "add", &cidr.to_string(), "dev", name],
        )?;
        Ok(())
    }

    fn configure_device(
        &self,
        name: &str,
        private_key: &StaticSecret,
        listen_port: u16,
    ) -> Result<()> {
        // The key goes to wg over stdin rather than through a file or the
        // process argument list.
        let mut child = Command::new("wg")
            .args([
                "set",
                name,
                "listen-port",
                &listen_port.to_string(),
                "private-key",
                "/dev/stdin",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::device("configure", name, format!("failed to run wg: {e}")))?;

        let key_line = format!("{}\n", keys::private_key_base64(private_key));
        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(key_line.as_bytes())
                .map_err(|e| Error::device("configure", name, e.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| Error::device("configure", name, e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::device("configure", name, stderr));
        }
        Ok(())
    }

    fn set_link_up(&self, name: &str) -> Result<()> {
        self.run("link-up", name, "ip", &["link", "set", "dev", name, "up"])?;
        Ok(())
    }

    fn apply_peer(&self, name: &str, public_key: &PublicKey, allowed_ip: Ipv4Net) -> Result<()> {
        self.run(
            "apply-peer",
            name,
            "wg",
            &[
                "set",
                name,
                "peer",
                &keys::public_key_base64(public_key),
                "allowed-ips",
                &allowed_ip.to_string(),
            ],
        )?;
        Ok(())
    }
}

/// Owns the tunnel interface lifecycle: find-or-create at startup, peer
/// application as joins are admitted.
pub struct InterfaceController {
    device: Arc<dyn DeviceControl>,
}

impl InterfaceController {
    /// Wrap a device-control capability
    pub fn new(device: Arc<dyn DeviceControl>) -> Self {
        Self { device }
    }

    /// Look up an existing device without mutating it
    pub fn discover(&self, name: &str) -> Result<Option<DeviceInfo>> {
        self.device.get_device(name)
    }

    /// Create and fully configure a device with a known keypair.
    ///
    /// Create, assign address, configure key and port, bring up — the whole
    /// sequence succeeds or the first failing step surfaces as a device
    /// error. A half-created device is reported, never silently kept.
    pub fn create(
        &self,
        name: &str,
        keypair: &KeyPair,
        subnet: Ipv4Net,
        listen_port: u16,
    ) -> Result<()> {
        self.device.create_device(name)?;
        self.device.assign_address(name, subnet)?;
        self.device
            .configure_device(name, &keypair.secret, listen_port)?;
        self.device.set_link_up(name)?;
        info!(device = name, %subnet, listen_port, "created tunnel interface");
        Ok(())
    }

    /// Find the named device or create it with a fresh keypair.
    ///
    /// An existing device is returned as-is; creation is never re-run on
    /// it. But an existing device without a persisted membership file means
    /// its private key is unrecoverable, which this coordinator treats as a
    /// corrupt deployment rather than guessing.
    pub fn discover_or_create(
        &self,
        name: &str,
        subnet: Ipv4Net,
        listen_port: u16,
    ) -> Result<InterfaceIdentity> {
        if self.discover(name)?.is_some() {
            return Err(Error::ConfigCorrupt(format!(
                "interface '{name}' already exists but no membership config was found; \
                 remove the interface or restore its config file"
            )));
        }

        let keypair = KeyPair::generate();
        self.create(name, &keypair, subnet, listen_port)?;
        Ok(InterfaceIdentity {
            name: name.to_string(),
            keypair,
            listen_port,
            subnet,
        })
    }

    /// Make sure the device behind a persisted identity exists, recreating
    /// it from the stored keypair when absent. Returns whether it was
    /// recreated.
    pub fn ensure_device(&self, identity: &InterfaceIdentity) -> Result<bool> {
        match self.discover(&identity.name)? {
            Some(info) => {
                if info.public_key != identity.keypair.public {
                    return Err(Error::device(
                        "discover",
                        &identity.name,
                        "live device public key does not match the persisted identity",
                    ));
                }
                Ok(false)
            }
            None => {
                self.create(
                    &identity.name,
                    &identity.keypair,
                    identity.subnet,
                    identity.listen_port,
                )?;
                Ok(true)
            }
        }
    }

    /// Push one admitted peer to the live device
    pub fn apply_peer(&self, name: &str, peer: &PeerRecord) -> Result<()> {
        self.device
            .apply_peer(name, &peer.public_key, Ipv4Net::from(peer.address))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory device for exercising the interface and join paths

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MockIface {
        pub public_key: Option<PublicKey>,
        pub listen_port: Option<u16>,
        pub address: Option<Ipv4Net>,
        pub up: bool,
        /// base64 public key -> allowed-ip, replace-on-write
        pub peers: HashMap<String, Ipv4Net>,
    }

    #[derive(Default)]
    pub struct MockDevice {
        pub ifaces: Mutex<HashMap<String, MockIface>>,
        pub fail_apply: AtomicBool,
        pub fail_configure: AtomicBool,
        pub apply_calls: AtomicUsize,
    }

    impl MockDevice {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn peer_count(&self, name: &str) -> usize {
            self.ifaces
                .lock()
                .unwrap()
                .get(name)
                .map(|i| i.peers.len())
                .unwrap_or(0)
        }

        pub fn is_up(&self, name: &str) -> bool {
            self.ifaces
                .lock()
                .unwrap()
                .get(name)
                .map(|i| i.up)
                .unwrap_or(false)
        }
    }

    impl DeviceControl for MockDevice {
        fn get_device(&self, name: &str) -> Result<Option<DeviceInfo>> {
            let ifaces = self.ifaces.lock().unwrap();
            Ok(ifaces.get(name).and_then(|i| {
                Some(DeviceInfo {
                    public_key: i.public_key?,
                    listen_port: i.listen_port.unwrap_or(0),
                })
            }))
        }

        fn create_device(&self, name: &str) -> Result<()> {
            let mut ifaces = self.ifaces.lock().unwrap();
            if ifaces.contains_key(name) {
                return Err(Error::device("create", name, "File exists"));
            }
            ifaces.insert(name.to_string(), MockIface::default());
            Ok(())
        }

        fn assign_address(&self, name: &str, cidr: Ipv4Net) -> Result<()> {
            let mut ifaces = self.ifaces.lock().unwrap();
            let iface = ifaces
                .get_mut(name)
                .ok_or_else(|| Error::device("assign-address", name, "no such device"))?;
            iface.address = Some(cidr);
            Ok(())
        }

        fn configure_device(
            &self,
            name: &str,
            private_key: &StaticSecret,
            listen_port: u16,
        ) -> Result<()> {
            if self.fail_configure.load(Ordering::SeqCst) {
                return Err(Error::device("configure", name, "injected failure"));
            }
            let mut ifaces = self.ifaces.lock().unwrap();
            let iface = ifaces
                .get_mut(name)
                .ok_or_else(|| Error::device("configure", name, "no such device"))?;
            iface.public_key = Some(PublicKey::from(private_key));
            iface.listen_port = Some(listen_port);
            Ok(())
        }

        fn set_link_up(&self, name: &str) -> Result<()> {
            let mut ifaces = self.ifaces.lock().unwrap();
            let iface = ifaces
                .get_mut(name)
                .ok_or_else(|| Error::device("link-up", name, "no such device"))?;
            iface.up = true;
            Ok(())
        }

        fn apply_peer(
            &self,
            name: &str,
            public_key: &PublicKey,
            allowed_ip: Ipv4Net,
        ) -> Result<()> {
            self.apply_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_apply.load(Ordering::SeqCst) {
                return Err(Error::device("apply-peer", name, "injected failure"));
            }
            let mut ifaces = self.ifaces.lock().unwrap();
            let iface = ifaces
                .get_mut(name)
                .ok_or_else(|| Error::device("apply-peer", name, "no such device"))?;
            iface
                .peers
                .insert(keys::public_key_base64(public_key), allowed_ip);
            Ok(())
        }
    }
}
