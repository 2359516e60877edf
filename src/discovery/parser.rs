//! Discovery reply decoding.
//!
//! Replies have a fixed binary head followed by a loosely structured ASCII
//! region. Layout of the head:
//!
//! | bytes  | field                                  |
//! |--------|----------------------------------------|
//! | 0..2   | header marker (`FF 24` or `FF 2C`)     |
//! | 2..5   | unused                                 |
//! | 5..9   | configured IPv4 address, octets reversed |
//! | 9..15  | hardware address                       |
//! | 15..   | ASCII: firmware version and model code |
//!
//! Anything that does not fit is noise from unrelated broadcasters and is
//! dropped without an error.

use std::{net::Ipv4Addr, ops::Range, sync::OnceLock};

use chrono::Utc;
use regex::Regex;

use super::{DiscoveredDevice, HardwareAddress, UNKNOWN};
use crate::{
    encoding::address_from_reversed, family::GatewayFamily, transport::constants::DISCOVERY_KEYWORD,
    util::{printable_ascii, Buffer},
};

/// Shortest datagram that can hold the binary head
pub const MIN_RESPONSE_LEN: usize = 20;

/// Accepted values of the first two bytes, as lowercase hex
pub const HEADER_MARKERS: [&str; 2] = ["ff24", "ff2c"];

/// Offset of the embedded address
pub const ADDRESS_OFFSET: usize = 5;

/// Offset of the hardware address
pub const HW_ADDRESS_OFFSET: usize = 9;

/// Where the firmware and model strings normally sit
pub const PRIMARY_TEXT_WINDOW: Range<usize> = 15..47;

/// Fallback window, starting right after the embedded address
pub const WIDE_TEXT_WINDOW_START: usize = HW_ADDRESS_OFFSET;

fn firmware_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"V?\d+\.\d+\.\d+").expect("firmware pattern is valid"))
}

fn model_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b(?:USR-)?[A-Z]\d{3}\b").expect("model pattern is valid"))
}

/// Decode a discovery reply.
///
/// Returns `None` for anything that is not a gateway reply: short buffers,
/// foreign headers and our own probe echoed back. A reply carrying a
/// sentinel address is still returned so the caller can follow the device
/// by hardware address while it reboots.
///
/// The address of the returned device is always `sender`; the embedded
/// address is kept in [`DiscoveredDevice::reported_address`].
pub fn parse(buffer: &[u8], sender: Ipv4Addr) -> Option<DiscoveredDevice> {
    let encoded = hex::encode(buffer);
    if encoded == hex::encode(DISCOVERY_KEYWORD) {
        log::debug!("ignoring echo of discovery probe from {}", sender);
        return None;
    }

    if buffer.len() < MIN_RESPONSE_LEN {
        log::debug!(
            "ignoring {} byte datagram from {}: too short",
            buffer.len(),
            sender
        );
        return None;
    }

    if !HEADER_MARKERS.iter().any(|marker| *marker == &encoded[..4]) {
        log::debug!("ignoring datagram from {} with header {}", sender, &encoded[..4]);
        return None;
    }

    let mut reader = Buffer::new(buffer);
    if !reader.skip(ADDRESS_OFFSET) {
        return None;
    }
    let embedded = address_from_reversed(reader.read_array::<4>()?);
    let hw_address = HardwareAddress::new(reader.read_array::<6>()?);

    let firmware = find_text(buffer, firmware_pattern());
    let model = find_text(buffer, model_pattern());

    if embedded != sender {
        log::debug!(
            "{} reports {} but replied from {}; using sender address",
            hw_address,
            embedded,
            sender
        );
    }

    let family = model
        .as_deref()
        .map(GatewayFamily::from_model)
        .unwrap_or(GatewayFamily::Unknown);

    Some(DiscoveredDevice {
        hw_address,
        address: sender,
        reported_address: embedded,
        model: model.unwrap_or_else(|| UNKNOWN.to_string()),
        firmware: firmware.unwrap_or_else(|| UNKNOWN.to_string()),
        family,
        reachable: None,
        last_seen: Utc::now(),
    })
}

/// Search the primary window, then the wide window, then the whole buffer
fn find_text(buffer: &[u8], pattern: &Regex) -> Option<String> {
    let len = buffer.len();
    let windows = [
        PRIMARY_TEXT_WINDOW.start.min(len)..PRIMARY_TEXT_WINDOW.end.min(len),
        WIDE_TEXT_WINDOW_START.min(len)..len,
        0..len,
    ];

    windows.into_iter().find_map(|window| {
        let text = printable_ascii(&buffer[window]);
        pattern.find(&text).map(|m| m.as_str().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::reversed_octets;
    use proptest::prelude::*;

    const MAC: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];

    fn reply(marker: [u8; 2], embedded: Ipv4Addr, text: &[u8]) -> Vec<u8> {
        let mut buf = vec![marker[0], marker[1], 0x00, 0x00, 0x00];
        buf.extend_from_slice(&reversed_octets(embedded));
        buf.extend_from_slice(&MAC);
        buf.extend_from_slice(text);
        while buf.len() < MIN_RESPONSE_LEN {
            buf.push(0);
        }
        buf
    }

    #[test]
    fn test_parse_full_reply() {
        let buf = reply(
            [0xFF, 0x24],
            Ipv4Addr::new(192, 168, 0, 7),
            b"V1.0.8\0USR-N510\0\0\0",
        );
        let device = parse(&buf, Ipv4Addr::new(192, 168, 0, 7)).unwrap();

        assert_eq!(device.hw_address.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(device.address, Ipv4Addr::new(192, 168, 0, 7));
        assert_eq!(device.firmware, "V1.0.8");
        assert_eq!(device.model, "USR-N510");
        assert_eq!(device.family, GatewayFamily::N510);
    }

    #[test]
    fn test_sender_address_wins() {
        let buf = reply([0xFF, 0x2C], Ipv4Addr::new(192, 168, 0, 7), b"N720 2.1.3");
        let device = parse(&buf, Ipv4Addr::new(10, 0, 0, 5)).unwrap();

        assert_eq!(device.address, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(device.reported_address, Ipv4Addr::new(192, 168, 0, 7));
        assert_eq!(device.model, "N720");
        assert_eq!(device.firmware, "2.1.3");
        assert_eq!(device.family, GatewayFamily::N720);
    }

    #[test]
    fn test_sentinel_address_is_kept() {
        let buf = reply([0xFF, 0x24], Ipv4Addr::UNSPECIFIED, b"");
        let device = parse(&buf, Ipv4Addr::UNSPECIFIED).unwrap();

        assert!(!device.has_usable_address());
        assert_eq!(device.model, UNKNOWN);
        assert_eq!(device.firmware, UNKNOWN);
        assert_eq!(device.family, GatewayFamily::Unknown);
    }

    #[test]
    fn test_text_found_outside_primary_window() {
        let mut text = vec![b' '; 40];
        text.extend_from_slice(b"V3.2.1 USR-N720");
        let buf = reply([0xFF, 0x24], Ipv4Addr::new(192, 168, 1, 20), &text);
        let device = parse(&buf, Ipv4Addr::new(192, 168, 1, 20)).unwrap();

        assert_eq!(device.firmware, "V3.2.1");
        assert_eq!(device.model, "USR-N720");
    }

    #[test]
    fn test_rejects_foreign_header() {
        let buf = reply([0x12, 0x34], Ipv4Addr::new(192, 168, 0, 7), b"V1.0.0");
        assert!(parse(&buf, Ipv4Addr::new(192, 168, 0, 7)).is_none());
    }

    #[test]
    fn test_rejects_echo_and_short() {
        let sender = Ipv4Addr::new(192, 168, 1, 2);
        assert!(parse(&DISCOVERY_KEYWORD, sender).is_none());
        assert!(parse(&[0xFF, 0x24, 0, 0], sender).is_none());
        assert!(parse(&[], sender).is_none());
    }

    proptest! {
        #[test]
        fn prop_short_buffers_yield_none(data in proptest::collection::vec(any::<u8>(), 0..MIN_RESPONSE_LEN)) {
            prop_assert!(parse(&data, Ipv4Addr::new(10, 0, 0, 1)).is_none());
        }

        #[test]
        fn prop_parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let sender = Ipv4Addr::new(10, 0, 0, 1);
            if let Some(device) = parse(&data, sender) {
                prop_assert_eq!(device.address, sender);
            }
        }
    }
}
