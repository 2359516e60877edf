//! Gateway Discovery Module
//!
//! This module turns UDP broadcast replies into a de-duplicated list of
//! gateways, keyed by hardware address.
//!
//! # Overview
//!
//! - [`parser`]: decodes one reply datagram into a [`DiscoveredDevice`]
//! - [`registry`]: merges parsed devices across replies and scans
//!
//! The socket side lives in [`crate::transport`], which feeds every inbound
//! datagram through [`parse`] and into a fresh [`DeviceRegistry`].
//!
//! A gateway's IP address is not a stable identity. While a technician moves
//! it from the factory address to a static address and then to DHCP, the same
//! unit replies from several addresses and sometimes with no usable address at
//! all. Everything here is therefore keyed by [`HardwareAddress`], and the
//! network address is treated as a mutable attribute of the record.
//!
//! # Example
//!
//! ```
//! use gwconf::discovery::{parser, registry::DeviceRegistry};
//! use std::net::Ipv4Addr;
//!
//! let mut registry = DeviceRegistry::new();
//! let reply = [0u8; 4];
//! if let Some(device) = parser::parse(&reply, Ipv4Addr::new(192, 168, 1, 50)) {
//!     registry.merge(device);
//! }
//! assert!(registry.is_empty());
//! ```

use std::{fmt, net::Ipv4Addr, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::{family::GatewayFamily, network};

pub mod parser;
pub mod registry;

pub use parser::parse;
pub use registry::{DeviceRegistry, MergeOutcome};

/// Placeholder for a model or firmware string the reply did not carry
pub const UNKNOWN: &str = "Unknown";

/// Address the gateways ship with
pub const FACTORY_DEFAULT_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 7);

/// Error parsing a textual hardware address
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid hardware address `{0}`")]
pub struct HardwareAddressError(pub String);

/// A 6-byte MAC address, the only stable identity of a gateway.
///
/// Equality compares the raw bytes, so `aa-bb-cc-dd-ee-ff` and
/// `AA:BB:CC:DD:EE:FF` are the same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    /// Wrap raw MAC bytes
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw MAC bytes
    pub fn octets(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for HardwareAddress {
    type Err = HardwareAddressError;

    /// Accepts `:`/`-` separated or bare hex, in any case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        let mut octets = [0u8; 6];
        hex::decode_to_slice(&digits, &mut octets)
            .map_err(|_| HardwareAddressError(s.to_string()))?;
        Ok(Self(octets))
    }
}

impl From<[u8; 6]> for HardwareAddress {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl Serialize for HardwareAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HardwareAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A gateway seen on the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    /// Identity key
    pub hw_address: HardwareAddress,
    /// Best known address; may be a sentinel while the gateway reboots
    pub address: Ipv4Addr,
    /// Address embedded in the reply payload, for display only
    pub reported_address: Ipv4Addr,
    pub model: String,
    pub firmware: String,
    pub family: GatewayFamily,
    /// Same-subnet hint; `None` when unknown or the address is a sentinel
    pub reachable: Option<bool>,
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredDevice {
    /// Create a record with placeholder model and firmware
    pub fn new(hw_address: HardwareAddress, address: Ipv4Addr) -> Self {
        Self {
            hw_address,
            address,
            reported_address: address,
            model: UNKNOWN.to_string(),
            firmware: UNKNOWN.to_string(),
            family: GatewayFamily::Unknown,
            reachable: None,
            last_seen: Utc::now(),
        }
    }

    /// Whether the address can be used to reach the gateway
    pub fn has_usable_address(&self) -> bool {
        !network::is_sentinel(self.address)
    }

    /// Whether the gateway still answers from its factory address
    pub fn is_factory_default(&self) -> bool {
        self.address == FACTORY_DEFAULT_ADDRESS
    }

    /// Whether the model string is still the placeholder
    pub fn model_unknown(&self) -> bool {
        self.model == UNKNOWN
    }

    /// Whether the firmware string is still the placeholder
    pub fn firmware_unknown(&self) -> bool {
        self.firmware == UNKNOWN
    }

    /// Recompute the reachability hint against local interfaces
    pub fn annotate_reachability(&mut self, interfaces: &[network::LocalInterface]) {
        self.reachable = if self.has_usable_address() {
            Some(network::is_reachable(self.address, interfaces))
        } else {
            None
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_address_parse_and_display() {
        let dashed: HardwareAddress = "aa-bb-cc-dd-ee-ff".parse().unwrap();
        let coloned: HardwareAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let bare: HardwareAddress = "aabbccddeeff".parse().unwrap();

        assert_eq!(dashed, coloned);
        assert_eq!(dashed, bare);
        assert_eq!(dashed.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_hardware_address_rejects_garbage() {
        assert!("AA:BB:CC".parse::<HardwareAddress>().is_err());
        assert!("GG:BB:CC:DD:EE:FF".parse::<HardwareAddress>().is_err());
        assert!("AA:BB:CC:DD:EE:FF:00".parse::<HardwareAddress>().is_err());
    }

    #[test]
    fn test_hardware_address_serde() {
        let mac = HardwareAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"00:11:22:33:44:55\"");
        let back: HardwareAddress = serde_json::from_str("\"00-11-22-33-44-55\"").unwrap();
        assert_eq!(back, mac);
    }

    #[test]
    fn test_device_address_state() {
        let mac = HardwareAddress::new([1, 2, 3, 4, 5, 6]);
        let mut device = DiscoveredDevice::new(mac, Ipv4Addr::UNSPECIFIED);
        assert!(!device.has_usable_address());
        assert!(device.model_unknown());
        assert!(device.firmware_unknown());

        let lan = network::LocalInterface::new(
            "eth0",
            Ipv4Addr::new(192, 168, 0, 10),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        device.annotate_reachability(std::slice::from_ref(&lan));
        assert_eq!(device.reachable, None);

        device.address = FACTORY_DEFAULT_ADDRESS;
        device.annotate_reachability(&[lan]);
        assert!(device.is_factory_default());
        assert_eq!(device.reachable, Some(true));
    }
}
