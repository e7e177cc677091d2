//! WgMesh - Coordinator and join agent for a WireGuard mesh network
//!
//! A coordinator process (`wgmeshd`) owns one WireGuard interface, hands out
//! unique virtual addresses to joining nodes over an authenticated HTTP API,
//! and durably records membership in the interface's standard config file so
//! the device can be rebuilt after a restart. The companion agent (`wgjoin`)
//! generates a keypair, requests admission, and writes the resulting tunnel
//! config locally.
//!
//! # Architecture
//!
//! Admission is a single critical section per interface: allocate the next
//! free address from the mesh subnet, push the peer to the live device, and
//! atomically rewrite the membership file — in that order, so the on-disk
//! record never runs ahead of the device. Joins are idempotent by public
//! key: rejoining returns the address assigned the first time.
//!
//! # Features
//!
//! - Deterministic ascending address allocation from a bounded subnet
//! - Crash-consistent membership persistence (temp file + rename)
//! - Idempotent interface bootstrap: discover an existing device or create
//!   and configure a fresh one
//! - Token-authenticated HTTP join protocol with full peer-list discovery
//! - Startup reconciliation of the live device against persisted membership

pub mod agent;
pub mod device;
pub mod error;
pub mod keys;
pub mod net;
pub mod server;
pub mod store;

pub use error::{Error, Result};
pub use keys::KeyPair;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::device::{DeviceControl, InterfaceController, WgDevice};
    pub use crate::error::{Error, Result};
    pub use crate::keys::KeyPair;
    pub use crate::net::AddressPool;
    pub use crate::store::{InterfaceIdentity, MembershipSnapshot, PeerRecord};
}
