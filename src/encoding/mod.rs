//! Configuration Command Encoding Module
//!
//! This module builds the fixed-layout UDP packets that push network settings
//! to a gateway and ask it to save and reboot. These commands are addressed by
//! hardware address and travel by broadcast, so they work even when the
//! gateway's current IP address is unreachable over HTTP.
//!
//! # Overview
//!
//! Every packet is described by a layout module whose constants name the byte
//! range of each field. Encoding writes fields into those ranges, and the
//! checksum covers a named range as well, so the layout can be audited and
//! tested independently of any socket code.
//!
//! ## Settings packet (89 bytes)
//!
//! | range  | field                                  |
//! |--------|----------------------------------------|
//! | 0..3   | header `FF 56 05`                      |
//! | 3..9   | hardware address                       |
//! | 9..15  | username, null padded                  |
//! | 15..21 | password, null padded                  |
//! | 21     | DHCP flag                              |
//! | 22..26 | IP address, octets reversed            |
//! | 26..30 | gateway, octets reversed               |
//! | 30..34 | netmask, octets reversed               |
//! | 34..88 | reserved                               |
//! | 88     | checksum of bytes 1..=87               |
//!
//! ## Save and reboot packet (22 bytes)
//!
//! | range  | field                                  |
//! |--------|----------------------------------------|
//! | 0..3   | header `FF 13 04`                      |
//! | 3..9   | hardware address                       |
//! | 9..15  | username                               |
//! | 15..21 | password                               |
//! | 21     | checksum of bytes 1..=20               |
//!
//! Addresses are written with their dotted-quad octets in reverse order
//! (`192.168.1.5` becomes `05 01 A8 C0`).
//!
//! # Example
//!
//! ```
//! use gwconf::encoding::{Credentials, NetworkSettings, SetConfigPacket, checksum};
//! use gwconf::discovery::HardwareAddress;
//!
//! let mac: HardwareAddress = "AA-BB-CC-DD-EE-FF".parse().unwrap();
//! let packet = SetConfigPacket::new(mac, Credentials::default(), NetworkSettings::Dhcp)
//!     .encode()
//!     .unwrap();
//! assert_eq!(packet.len(), 89);
//! assert_eq!(packet[88], checksum(&packet[1..88]));
//! ```

use std::{net::Ipv4Addr, ops::Range};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::discovery::HardwareAddress;

/// Result type for encoding operations
pub type Result<T> = std::result::Result<T, EncodingError>;

/// Errors that can occur while building command packets
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    /// A credential does not fit its fixed-width field
    #[error("{field} is {len} bytes, the packet field holds {max}")]
    CredentialTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    /// A credential contains a NUL byte, which would be read as padding
    #[error("{field} must not contain NUL bytes")]
    CredentialContainsNul { field: &'static str },
}

/// Width of the username and password fields
pub const CREDENTIAL_WIDTH: usize = 6;

/// Gateway login credentials, used both in UDP commands and HTTP Basic auth
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: "admin".into(),
            password: "admin".into(),
        }
    }
}

impl Credentials {
    /// Create credentials
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn padded(field: &'static str, value: &str) -> Result<[u8; CREDENTIAL_WIDTH]> {
        let bytes = value.as_bytes();
        if bytes.len() > CREDENTIAL_WIDTH {
            return Err(EncodingError::CredentialTooLong {
                field,
                len: bytes.len(),
                max: CREDENTIAL_WIDTH,
            });
        }
        if bytes.contains(&0) {
            return Err(EncodingError::CredentialContainsNul { field });
        }
        let mut out = [0u8; CREDENTIAL_WIDTH];
        out[..bytes.len()].copy_from_slice(bytes);
        Ok(out)
    }

    /// Username as a null-padded fixed-width field
    pub fn username_field(&self) -> Result<[u8; CREDENTIAL_WIDTH]> {
        Self::padded("username", &self.username)
    }

    /// Password as a null-padded fixed-width field
    pub fn password_field(&self) -> Result<[u8; CREDENTIAL_WIDTH]> {
        Self::padded("password", &self.password)
    }
}

/// Desired addressing mode of the gateway's LAN port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum NetworkSettings {
    /// Obtain an address from DHCP
    Dhcp,
    /// Use a fixed address
    Static {
        ip: Ipv4Addr,
        gateway: Ipv4Addr,
        netmask: Ipv4Addr,
    },
}

impl NetworkSettings {
    /// Whether DHCP is requested
    pub fn is_dhcp(&self) -> bool {
        matches!(self, NetworkSettings::Dhcp)
    }
}

/// Byte layout of the settings packet
pub mod settings_layout {
    use std::ops::Range;

    pub const HEADER: Range<usize> = 0..3;
    pub const HW_ADDRESS: Range<usize> = 3..9;
    pub const USERNAME: Range<usize> = 9..15;
    pub const PASSWORD: Range<usize> = 15..21;
    pub const DHCP_FLAG: usize = 21;
    pub const IP: Range<usize> = 22..26;
    pub const GATEWAY: Range<usize> = 26..30;
    pub const NETMASK: Range<usize> = 30..34;
    pub const RESERVED: Range<usize> = 34..88;
    pub const CHECKSUM: usize = 88;
    /// Bytes summed into the checksum
    pub const CHECKSUM_REGION: Range<usize> = 1..88;
    pub const LEN: usize = 89;

    pub const HEADER_BYTES: [u8; 3] = [0xFF, 0x56, 0x05];
    pub const DHCP_ON: u8 = 0x01;
    pub const DHCP_OFF: u8 = 0x00;
}

/// Byte layout of the save-and-reboot packet
pub mod save_layout {
    use std::ops::Range;

    pub const HEADER: Range<usize> = 0..3;
    pub const HW_ADDRESS: Range<usize> = 3..9;
    pub const USERNAME: Range<usize> = 9..15;
    pub const PASSWORD: Range<usize> = 15..21;
    pub const CHECKSUM: usize = 21;
    pub const CHECKSUM_REGION: Range<usize> = 1..21;
    pub const LEN: usize = 22;

    pub const HEADER_BYTES: [u8; 3] = [0xFF, 0x13, 0x04];
}

/// Unsigned byte sum modulo 256
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Dotted-quad octets in reverse order, as the gateway expects them
pub fn reversed_octets(address: Ipv4Addr) -> [u8; 4] {
    let [a, b, c, d] = address.octets();
    [d, c, b, a]
}

/// Inverse of [`reversed_octets`]
pub fn address_from_reversed(bytes: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[3], bytes[2], bytes[1], bytes[0])
}

fn put(packet: &mut [u8], range: Range<usize>, bytes: &[u8]) {
    packet[range].copy_from_slice(bytes);
}

/// Command that writes addressing settings to one gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetConfigPacket {
    pub hw_address: HardwareAddress,
    pub credentials: Credentials,
    pub settings: NetworkSettings,
}

impl SetConfigPacket {
    /// Create a settings command
    pub fn new(
        hw_address: HardwareAddress,
        credentials: Credentials,
        settings: NetworkSettings,
    ) -> Self {
        Self {
            hw_address,
            credentials,
            settings,
        }
    }

    /// Encode to the 89-byte wire format
    pub fn encode(&self) -> Result<[u8; settings_layout::LEN]> {
        use settings_layout as l;

        let mut packet = [0u8; l::LEN];
        put(&mut packet, l::HEADER, &l::HEADER_BYTES);
        put(&mut packet, l::HW_ADDRESS, self.hw_address.octets());
        put(&mut packet, l::USERNAME, &self.credentials.username_field()?);
        put(&mut packet, l::PASSWORD, &self.credentials.password_field()?);

        match self.settings {
            NetworkSettings::Dhcp => {
                packet[l::DHCP_FLAG] = l::DHCP_ON;
            }
            NetworkSettings::Static {
                ip,
                gateway,
                netmask,
            } => {
                packet[l::DHCP_FLAG] = l::DHCP_OFF;
                put(&mut packet, l::IP, &reversed_octets(ip));
                put(&mut packet, l::GATEWAY, &reversed_octets(gateway));
                put(&mut packet, l::NETMASK, &reversed_octets(netmask));
            }
        }

        packet[l::CHECKSUM] = checksum(&packet[l::CHECKSUM_REGION]);
        Ok(packet)
    }
}

/// Command that persists pending settings and reboots the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRebootPacket {
    pub hw_address: HardwareAddress,
    pub credentials: Credentials,
}

impl SaveRebootPacket {
    /// Create a save-and-reboot command
    pub fn new(hw_address: HardwareAddress, credentials: Credentials) -> Self {
        Self {
            hw_address,
            credentials,
        }
    }

    /// Encode to the 22-byte wire format
    pub fn encode(&self) -> Result<[u8; save_layout::LEN]> {
        use save_layout as l;

        let mut packet = [0u8; l::LEN];
        put(&mut packet, l::HEADER, &l::HEADER_BYTES);
        put(&mut packet, l::HW_ADDRESS, self.hw_address.octets());
        put(&mut packet, l::USERNAME, &self.credentials.username_field()?);
        put(&mut packet, l::PASSWORD, &self.credentials.password_field()?);
        packet[l::CHECKSUM] = checksum(&packet[l::CHECKSUM_REGION]);
        Ok(packet)
    }
}

/// A settings command always followed by a save-and-reboot command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfigCommand {
    pub hw_address: HardwareAddress,
    pub credentials: Credentials,
    pub settings: NetworkSettings,
}

impl NetworkConfigCommand {
    /// Create a command pair for one gateway
    pub fn new(
        hw_address: HardwareAddress,
        credentials: Credentials,
        settings: NetworkSettings,
    ) -> Self {
        Self {
            hw_address,
            credentials,
            settings,
        }
    }

    /// Encode both datagrams, settings first
    pub fn encode(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let settings = SetConfigPacket::new(
            self.hw_address,
            self.credentials.clone(),
            self.settings,
        )
        .encode()?;
        let save = SaveRebootPacket::new(self.hw_address, self.credentials.clone()).encode()?;
        Ok((settings.to_vec(), save.to_vec()))
    }
}

/// Reply prefix confirming the settings packet was accepted
pub const ACK_SETTINGS: [u8; 4] = [0xFF, 0x01, 0x56, 0x4B];

/// Reply prefix confirming the save-and-reboot packet was accepted
pub const ACK_SAVE_REBOOT: [u8; 4] = [0xFF, 0x01, 0x13, 0x4B];

bitflags! {
    /// Acknowledgements collected for a command pair
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct AckFlags: u8 {
        const SETTINGS = 0b0000_0001;
        const SAVE_REBOOT = 0b0000_0010;
    }
}

impl AckFlags {
    /// Both acknowledgements were seen
    pub fn is_complete(&self) -> bool {
        self.contains(AckFlags::SETTINGS | AckFlags::SAVE_REBOOT)
    }
}

/// Match a reply datagram against the known acknowledgement patterns
pub fn recognize_ack(reply: &[u8]) -> Option<AckFlags> {
    if reply.starts_with(&ACK_SETTINGS) {
        Some(AckFlags::SETTINGS)
    } else if reply.starts_with(&ACK_SAVE_REBOOT) {
        Some(AckFlags::SAVE_REBOOT)
    } else {
        None
    }
}
