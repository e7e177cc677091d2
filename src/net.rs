//! Virtual address allocation for the mesh subnet
//!
//! The coordinator hands each admitted peer one host address out of the
//! interface subnet. Allocation scans the usable host range in ascending
//! order and returns the first address not already taken, so the outcome is
//! fully determined by the subnet and the current membership — the same
//! inputs always produce the same address, and the pool only reports
//! exhaustion when every usable host really is taken.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// Allocates free host addresses from a bounded subnet
#[derive(Debug, Clone, Copy)]
pub struct AddressPool {
    subnet: Ipv4Net,
}

impl AddressPool {
    /// Create a pool over the given subnet
    pub fn new(subnet: Ipv4Net) -> Self {
        Self { subnet }
    }

    /// The subnet this pool allocates from
    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    /// Allocate the lowest usable host address not present in `taken`.
    ///
    /// The network address is never eligible; for subnets that have one,
    /// neither is the broadcast address (`Ipv4Net::hosts` already excludes
    /// both for prefixes up to /30).
    pub fn allocate(&self, taken: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        self.subnet
            .hosts()
            .find(|ip| *ip != self.subnet.network() && !taken.contains(ip))
            .ok_or(Error::Exhausted {
                subnet: self.subnet,
            })
    }
}
