#![doc = include_str!("../README.md")]

pub mod adapter;
pub mod client;
pub mod discovery;
pub mod encoding;
pub mod family;
pub mod http;
pub mod network;
pub mod transport;
pub mod util;
pub mod workflow;

// Re-export main types without glob imports to avoid conflicts
pub use adapter::{Adapter, AdapterError, Document, GatewayAdapter, WriteAck, WritePayload};
pub use client::{ClientConfig, GatewayClient};
pub use discovery::{DeviceRegistry, DiscoveredDevice, HardwareAddress};
pub use encoding::{Credentials, NetworkConfigCommand, NetworkSettings};
pub use family::GatewayFamily;
pub use transport::{BroadcastTransport, DiscoveryConfig};
pub use workflow::{Provisioner, ProvisioningPlan, ProvisioningTarget};

/// UDP port gateways listen on for search and configuration datagrams
pub const GATEWAY_UDP_PORT: u16 = transport::constants::DISCOVERY_PORT;
