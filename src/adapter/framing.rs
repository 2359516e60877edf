//! CRC32 framing of N720 flash payloads.
//!
//! The firmware expects edge-report documents on flash as
//! `crc32(json) as u32 little-endian ++ json`, using the IEEE 802.3 CRC
//! (reflected polynomial `0xEDB88320`, init and final XOR `0xFFFFFFFF`).

use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

/// The CRC used by the flash loader
pub const FLASH_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Length of the CRC prefix
pub const CRC_LEN: usize = 4;

/// Errors unwrapping a CRC-framed payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrcError {
    #[error("framed payload is {0} bytes, shorter than the CRC header")]
    TooShort(usize),
    #[error("CRC mismatch: header {stored:#010x}, computed {computed:#010x}")]
    Mismatch { stored: u32, computed: u32 },
}

/// CRC32 of `payload`
pub fn flash_crc(payload: &[u8]) -> u32 {
    FLASH_CRC.checksum(payload)
}

/// Prefix `payload` with its little-endian CRC32
pub fn prepend_crc(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(CRC_LEN + payload.len());
    framed.extend_from_slice(&flash_crc(payload).to_le_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Check and remove the CRC prefix
pub fn strip_crc(framed: &[u8]) -> Result<&[u8], CrcError> {
    if framed.len() < CRC_LEN {
        return Err(CrcError::TooShort(framed.len()));
    }
    let (header, payload) = framed.split_at(CRC_LEN);
    let stored = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let computed = flash_crc(payload);
    if stored != computed {
        return Err(CrcError::Mismatch { stored, computed });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_check_value() {
        assert_eq!(flash_crc(b"123456789"), 0xCBF4_3926);
        assert_eq!(&prepend_crc(b"123456789")[..4], &[0x26, 0x39, 0xF4, 0xCB]);
    }

    #[test]
    fn test_corruption_detected() {
        let mut framed = prepend_crc(br#"{"group":[]}"#);
        framed[6] ^= 0x01;
        assert!(matches!(strip_crc(&framed), Err(CrcError::Mismatch { .. })));
        assert_eq!(strip_crc(&[0x01, 0x02]), Err(CrcError::TooShort(2)));
    }

    proptest! {
        #[test]
        fn prop_strip_undoes_prepend(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
            let framed = prepend_crc(&payload);
            prop_assert_eq!(strip_crc(&framed).unwrap(), payload.as_slice());
        }

        #[test]
        fn prop_any_flipped_payload_byte_is_caught(
            payload in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut framed = prepend_crc(&payload);
            let at = CRC_LEN + index.index(payload.len());
            framed[at] ^= flip;
            prop_assert!(strip_crc(&framed).is_err());
        }
    }
}
