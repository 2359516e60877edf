//! Local Network Module
//!
//! This module answers two questions about the host's own IPv4 configuration:
//! where discovery datagrams should be broadcast, and whether a discovered
//! gateway sits on the same subnet as one of our interfaces.
//!
//! # Overview
//!
//! - Interface enumeration (non-loopback IPv4 only) via `if-addrs`
//! - Directed broadcast computation (`address | !netmask`, per octet)
//! - Subnet reachability classification (`candidate & mask == iface & mask`)
//! - Sentinel address detection (`0.0.0.0`, `255.255.255.255`)
//!
//! Reachability is a UI hint. Nothing in the crate refuses to talk to a
//! device because it looks like it lives on another subnet.
//!
//! # Example
//!
//! ```
//! use gwconf::network::{directed_broadcast, is_reachable, LocalInterface};
//! use std::net::Ipv4Addr;
//!
//! let eth0 = LocalInterface::new("eth0", Ipv4Addr::new(192, 168, 1, 10), Ipv4Addr::new(255, 255, 255, 0));
//! assert_eq!(directed_broadcast(eth0.address, eth0.netmask), Ipv4Addr::new(192, 168, 1, 255));
//! assert!(is_reachable(Ipv4Addr::new(192, 168, 1, 50), &[eth0]));
//! ```

use std::net::Ipv4Addr;

use if_addrs::{get_if_addrs, IfAddr};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Errors that can occur while inspecting local interfaces
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The operating system refused to list interfaces
    #[error("interface enumeration failed: {0}")]
    Enumeration(#[from] std::io::Error),
}

/// A local IPv4 interface as seen by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalInterface {
    /// OS interface name (e.g. `eth0`)
    pub name: String,
    /// Interface address
    pub address: Ipv4Addr,
    /// Interface netmask
    pub netmask: Ipv4Addr,
}

impl LocalInterface {
    /// Create an interface description
    pub fn new(name: impl Into<String>, address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            address,
            netmask,
        }
    }

    /// Directed broadcast address of this interface's subnet
    pub fn broadcast(&self) -> Ipv4Addr {
        directed_broadcast(self.address, self.netmask)
    }

    /// Network portion of this interface's address
    pub fn network(&self) -> Ipv4Addr {
        network_of(self.address, self.netmask)
    }

    /// Whether `candidate` shares this interface's network portion
    pub fn contains(&self, candidate: Ipv4Addr) -> bool {
        network_of(candidate, self.netmask) == self.network()
    }
}

/// Enumerate non-loopback IPv4 interfaces of this host
pub fn local_interfaces() -> Result<Vec<LocalInterface>> {
    let mut interfaces = Vec::new();

    for iface in get_if_addrs()? {
        let IfAddr::V4(v4) = iface.addr else {
            continue;
        };
        if v4.ip.is_loopback() {
            continue;
        }
        interfaces.push(LocalInterface::new(iface.name, v4.ip, v4.netmask));
    }

    log::debug!("found {} usable IPv4 interface(s)", interfaces.len());
    Ok(interfaces)
}

/// Compute the directed broadcast address: `address | !netmask`, per octet
pub fn directed_broadcast(address: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    let a = address.octets();
    let m = netmask.octets();
    Ipv4Addr::new(a[0] | !m[0], a[1] | !m[1], a[2] | !m[2], a[3] | !m[3])
}

/// Compute the network portion: `address & netmask`
pub fn network_of(address: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(address) & u32::from(netmask))
}

/// Whether `candidate` is on the same subnet as any of `interfaces`.
///
/// Loopback entries are ignored even if a caller passes them in.
pub fn is_reachable(candidate: Ipv4Addr, interfaces: &[LocalInterface]) -> bool {
    interfaces
        .iter()
        .filter(|iface| !iface.address.is_loopback())
        .any(|iface| iface.contains(candidate))
}

/// Whether the address is one of the "no usable address yet" sentinels
pub fn is_sentinel(address: Ipv4Addr) -> bool {
    address.is_unspecified() || address.is_broadcast()
}
