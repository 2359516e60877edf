//! Broadcast Transport Module
//!
//! This module owns the UDP side of the gateway protocol: discovery scans
//! and the network configuration command pair.
//!
//! # Overview
//!
//! The transport handles:
//! - Discovery on UDP port 1901 with the 4-byte keyword `FF 01 01 02`
//! - Broadcast to `255.255.255.255` and to the directed broadcast address of
//!   every non-loopback IPv4 interface, one datagram per distinct target
//! - Timer-bounded collection of replies into a [`DeviceRegistry`]
//! - Sending settings + save/reboot datagrams and collecting both
//!   acknowledgements
//!
//! # Degradation
//!
//! Broadcast is commonly blocked in sandboxes and virtual machines. A scan
//! that cannot bind or send logs a warning and returns an empty list;
//! callers fall back to manual address entry.
//!
//! # Example
//!
//! ```no_run
//! use gwconf::transport::{BroadcastTransport, DiscoveryConfig};
//! use std::time::Duration;
//!
//! # async fn demo() {
//! let transport = BroadcastTransport::new(DiscoveryConfig::default());
//! for device in transport.scan(Duration::from_secs(5)).await {
//!     println!("{} at {}", device.hw_address, device.address);
//! }
//! # }
//! ```

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    ops::ControlFlow,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;
use tokio::{net::UdpSocket, time::Instant};

use crate::{
    discovery::{parser, DeviceRegistry, DiscoveredDevice},
    encoding::{recognize_ack, AckFlags, EncodingError, NetworkConfigCommand},
    network::{local_interfaces, LocalInterface},
    util::hex_dump,
};

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket setup or I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The command could not be encoded
    #[error("encoding failed: {0}")]
    Encoding(#[from] EncodingError),
    /// No datagram could be sent to any target
    #[error("no broadcast target accepted the datagram")]
    NothingSent,
    /// The acknowledgement window closed before both acks arrived
    #[error("command not acknowledged (received {received:?})")]
    Unacknowledged { received: AckFlags },
}

/// Protocol constants
pub mod constants {
    use std::time::Duration;

    /// Discovery and command port
    pub const DISCOVERY_PORT: u16 = 1901;

    /// Discovery probe payload
    pub const DISCOVERY_KEYWORD: [u8; 4] = [0xFF, 0x01, 0x01, 0x02];

    /// Receive buffer size
    pub const MAX_DATAGRAM: usize = 1500;

    /// Default scan window
    pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

    /// Pause between the settings and save/reboot datagrams
    pub const DEFAULT_COMMAND_GAP: Duration = Duration::from_millis(500);

    /// How long to wait for command acknowledgements
    pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(3);
}

/// UDP transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Local bind address; port 0 picks an ephemeral port
    pub bind_address: SocketAddrV4,
    /// Device port
    pub port: u16,
    /// Receive buffer size
    pub buffer_size: usize,
    /// Scan window in milliseconds
    pub scan_timeout_ms: u64,
    /// Settings to save/reboot gap in milliseconds
    pub command_gap_ms: u64,
    /// Acknowledgement window in milliseconds
    pub ack_timeout_ms: u64,
    /// Also send to each interface's directed broadcast address
    pub directed_broadcast: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            port: constants::DISCOVERY_PORT,
            buffer_size: constants::MAX_DATAGRAM,
            scan_timeout_ms: constants::DEFAULT_SCAN_TIMEOUT.as_millis() as u64,
            command_gap_ms: constants::DEFAULT_COMMAND_GAP.as_millis() as u64,
            ack_timeout_ms: constants::DEFAULT_ACK_TIMEOUT.as_millis() as u64,
            directed_broadcast: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn command_gap(&self) -> Duration {
        Duration::from_millis(self.command_gap_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Distinct broadcast destinations: global first, then each interface's
/// directed broadcast
pub fn broadcast_targets(
    interfaces: &[LocalInterface],
    port: u16,
    directed: bool,
) -> Vec<SocketAddrV4> {
    let mut targets = vec![SocketAddrV4::new(Ipv4Addr::BROADCAST, port)];
    if directed {
        for iface in interfaces.iter().filter(|i| !i.address.is_loopback()) {
            let target = SocketAddrV4::new(iface.broadcast(), port);
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }
    targets
}

/// A broadcast-enabled UDP socket
pub struct BroadcastSocket {
    socket: UdpSocket,
    buffer: Vec<u8>,
}

impl BroadcastSocket {
    /// Bind a non-blocking broadcast socket.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: &DiscoveryConfig) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_broadcast(true)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(config.bind_address))?;

        let socket = UdpSocket::from_std(socket.into())?;
        log::debug!("discovery socket bound to {}", socket.local_addr()?);

        Ok(Self {
            socket,
            buffer: vec![0u8; config.buffer_size.max(1)],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send `payload` once to each target, returning how many sends succeeded
    pub async fn send_to_targets(&self, payload: &[u8], targets: &[SocketAddrV4]) -> usize {
        let mut sent = 0;
        for target in targets {
            match self.socket.send_to(payload, *target).await {
                Ok(_) => sent += 1,
                Err(e) => log::warn!("send to {} failed: {}", target, e),
            }
        }
        sent
    }

    /// Hand every datagram received before `deadline` to `on_datagram`.
    ///
    /// Returns early only when `on_datagram` breaks. Transient receive errors
    /// (ICMP port unreachable surfacing as a reset) are skipped.
    pub async fn receive_until<F>(&mut self, deadline: Instant, mut on_datagram: F) -> Result<usize>
    where
        F: FnMut(&[u8], SocketAddr) -> ControlFlow<()>,
    {
        let mut received = 0;
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut self.buffer) => match result {
                    Ok((len, from)) => {
                        received += 1;
                        if on_datagram(&self.buffer[..len], from).is_break() {
                            return Ok(received);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        log::debug!("ignoring receive error: {}", e);
                    }
                    Err(e) => return Err(e.into()),
                },
                _ = tokio::time::sleep_until(deadline) => return Ok(received),
            }
        }
    }
}

/// UDP discovery and command transport
#[derive(Debug, Clone, Default)]
pub struct BroadcastTransport {
    config: DiscoveryConfig,
}

impl BroadcastTransport {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    fn interfaces() -> Vec<LocalInterface> {
        local_interfaces().unwrap_or_else(|e| {
            log::warn!("cannot list interfaces, using global broadcast only: {}", e);
            Vec::new()
        })
    }

    /// Scan for gateways for the whole of `timeout`.
    ///
    /// Never fails; socket problems produce an empty list.
    pub async fn scan(&self, timeout: Duration) -> Vec<DiscoveredDevice> {
        let interfaces = Self::interfaces();
        let targets = broadcast_targets(&interfaces, self.config.port, self.config.directed_broadcast);

        let mut registry = self.scan_targets(&targets, timeout).await;
        registry.annotate_reachability(&interfaces);
        registry.into_devices()
    }

    /// Scan with an explicit target list
    pub async fn scan_targets(&self, targets: &[SocketAddrV4], timeout: Duration) -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();

        let mut socket = match BroadcastSocket::bind(&self.config) {
            Ok(socket) => socket,
            Err(e) => {
                log::warn!("discovery unavailable, cannot bind: {}", e);
                return registry;
            }
        };

        let deadline = Instant::now() + timeout;
        let sent = socket
            .send_to_targets(&constants::DISCOVERY_KEYWORD, targets)
            .await;
        if sent == 0 {
            log::warn!("discovery unavailable, no target accepted the probe");
            return registry;
        }
        log::debug!("discovery probe sent to {} target(s)", sent);

        let result = socket
            .receive_until(deadline, |data, from| {
                let SocketAddr::V4(from) = from else {
                    return ControlFlow::Continue(());
                };
                match parser::parse(data, *from.ip()) {
                    Some(device) => {
                        registry.merge(device);
                    }
                    None => log::trace!("discarded datagram from {}:\n{}", from, hex_dump(data, "  ")),
                }
                ControlFlow::Continue(())
            })
            .await;

        match result {
            Ok(received) => log::info!(
                "scan finished: {} repl(ies), {} device(s)",
                received,
                registry.len()
            ),
            Err(e) => log::warn!("scan aborted after receive error: {}", e),
        }
        registry
    }

    /// Send a network settings command followed by save/reboot.
    ///
    /// Succeeds only when both acknowledgements arrive.
    pub async fn send_network_config(&self, command: &NetworkConfigCommand) -> Result<AckFlags> {
        let interfaces = Self::interfaces();
        let targets = broadcast_targets(&interfaces, self.config.port, self.config.directed_broadcast);
        self.send_network_config_to(command, &targets).await
    }

    /// Send the command pair to an explicit target list
    pub async fn send_network_config_to(
        &self,
        command: &NetworkConfigCommand,
        targets: &[SocketAddrV4],
    ) -> Result<AckFlags> {
        let (settings, save) = command.encode()?;
        let mut socket = BroadcastSocket::bind(&self.config)?;

        if socket.send_to_targets(&settings, targets).await == 0 {
            return Err(TransportError::NothingSent);
        }
        tokio::time::sleep(self.config.command_gap()).await;
        if socket.send_to_targets(&save, targets).await == 0 {
            return Err(TransportError::NothingSent);
        }
        log::info!(
            "network settings ({}) sent to {}",
            if command.settings.is_dhcp() { "DHCP" } else { "static" },
            command.hw_address
        );

        let mut acks = AckFlags::empty();
        let deadline = Instant::now() + self.config.ack_timeout();
        socket
            .receive_until(deadline, |data, from| {
                if let Some(ack) = recognize_ack(data) {
                    log::debug!("ack {:?} from {}", ack, from);
                    acks |= ack;
                }
                if acks.is_complete() {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .await?;

        if acks.is_complete() {
            Ok(acks)
        } else {
            log::warn!("{} acknowledged only {:?}", command.hw_address, acks);
            Err(TransportError::Unacknowledged { received: acks })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        discovery::HardwareAddress,
        encoding::{reversed_octets, Credentials, NetworkSettings, ACK_SAVE_REBOOT, ACK_SETTINGS},
    };

    fn reply(mac: [u8; 6], embedded: Ipv4Addr) -> Vec<u8> {
        let mut buf = vec![0xFF, 0x24, 0x00, 0x00, 0x00];
        buf.extend_from_slice(&reversed_octets(embedded));
        buf.extend_from_slice(&mac);
        buf.extend_from_slice(b"V1.0.8 USR-N510\0\0\0\0");
        buf
    }

    async fn fake_device() -> (UdpSocket, SocketAddrV4) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(addr) = socket.local_addr().unwrap() else {
            unreachable!()
        };
        (socket, addr)
    }

    fn loopback_config(port: u16) -> DiscoveryConfig {
        DiscoveryConfig {
            bind_address: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            port,
            ack_timeout_ms: 1000,
            command_gap_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_broadcast_targets_deduplicated() {
        let interfaces = vec![
            LocalInterface::new("eth0", Ipv4Addr::new(192, 168, 1, 10), Ipv4Addr::new(255, 255, 255, 0)),
            LocalInterface::new("eth0:1", Ipv4Addr::new(192, 168, 1, 11), Ipv4Addr::new(255, 255, 255, 0)),
            LocalInterface::new("wlan0", Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(255, 0, 0, 0)),
        ];

        let targets = broadcast_targets(&interfaces, 1901, true);
        assert_eq!(
            targets,
            vec![
                SocketAddrV4::new(Ipv4Addr::BROADCAST, 1901),
                SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 255), 1901),
                SocketAddrV4::new(Ipv4Addr::new(10, 255, 255, 255), 1901),
            ]
        );
        assert_eq!(broadcast_targets(&interfaces, 1901, false).len(), 1);
    }

    #[test]
    fn test_config_defaults() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.port, 1901);
        assert_eq!(config.scan_timeout(), Duration::from_secs(5));
        assert_eq!(config.command_gap(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_scan_collects_until_timer() {
        let (device, addr) = fake_device().await;
        let transport = BroadcastTransport::new(loopback_config(addr.port()));
        let mac = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = device.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], &constants::DISCOVERY_KEYWORD);
            device.send_to(&reply(mac, Ipv4Addr::UNSPECIFIED), from).await.unwrap();
            device.send_to(&reply(mac, Ipv4Addr::new(192, 168, 0, 7)), from).await.unwrap();
            device.send_to(&[0xFF, 0x01], from).await.unwrap();
        });

        let timeout = Duration::from_millis(300);
        let started = std::time::Instant::now();
        let registry = transport.scan_targets(&[addr], timeout).await;
        responder.await.unwrap();

        assert!(started.elapsed() >= timeout);
        assert_eq!(registry.len(), 1);
        let found = registry.find(&HardwareAddress::new(mac)).unwrap();
        assert_eq!(found.address, Ipv4Addr::LOCALHOST);
        assert_eq!(found.model, "USR-N510");
    }

    #[tokio::test]
    async fn test_scan_without_local_bind_address_is_empty() {
        let transport = BroadcastTransport::new(DiscoveryConfig {
            bind_address: SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 0),
            ..Default::default()
        });
        let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, constants::DISCOVERY_PORT);

        let started = std::time::Instant::now();
        let registry = transport.scan_targets(&[target], Duration::from_secs(5)).await;

        assert!(registry.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(transport.scan(Duration::from_millis(50)).await.is_empty());
    }

    #[tokio::test]
    async fn test_scan_with_no_accepted_target_is_empty() {
        let transport = BroadcastTransport::new(loopback_config(constants::DISCOVERY_PORT));
        // UDP refuses destination port 0
        let unsendable = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);

        let started = std::time::Instant::now();
        let registry = transport.scan_targets(&[unsendable], Duration::from_secs(5)).await;
        assert!(registry.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));

        let registry = transport.scan_targets(&[], Duration::from_secs(5)).await;
        assert!(registry.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_network_config_needs_both_acks() {
        let (device, addr) = fake_device().await;
        let transport = BroadcastTransport::new(loopback_config(addr.port()));
        let command = NetworkConfigCommand::new(
            HardwareAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            Credentials::default(),
            NetworkSettings::Dhcp,
        );

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (len, from) = device.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 89);
            device.send_to(&ACK_SETTINGS, from).await.unwrap();
            let (len, from) = device.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 22);
            device.send_to(&ACK_SAVE_REBOOT, from).await.unwrap();
        });

        let acks = transport.send_network_config_to(&command, &[addr]).await.unwrap();
        responder.await.unwrap();
        assert!(acks.is_complete());
    }

    #[tokio::test]
    async fn test_network_config_partial_ack_is_error() {
        let (device, addr) = fake_device().await;
        let mut config = loopback_config(addr.port());
        config.ack_timeout_ms = 200;
        let transport = BroadcastTransport::new(config);
        let command = NetworkConfigCommand::new(
            HardwareAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            Credentials::default(),
            NetworkSettings::Dhcp,
        );

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (_, from) = device.recv_from(&mut buf).await.unwrap();
            device.send_to(&ACK_SETTINGS, from).await.unwrap();
        });

        let result = transport.send_network_config_to(&command, &[addr]).await;
        responder.await.unwrap();
        match result {
            Err(TransportError::Unacknowledged { received }) => {
                assert_eq!(received, AckFlags::SETTINGS)
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
