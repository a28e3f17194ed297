//! Fixed 48-byte frame header.
//!
//! ```text
//! offset  size  field
//!      0     4  magic         u32  (0xDEADBEEF)
//!      4     2  version       u16
//!      6     2  sequence      u16  (wraps)
//!      8     4  width         u32
//!     12     4  height        u32
//!     16     4  stride        u32  (bytes per row)
//!     20     4  payload_size  u32
//!     24     8  timestamp     u64  (ms since UNIX epoch)
//!     32     1  flags         u8
//!     33    15  reserved      zero
//! ```
//!
//! All multi-byte fields are little-endian regardless of host order.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StreamError;
use crate::flags::FrameFlags;

/// Protocol sentinel.
pub const MAGIC: u32 = 0xDEAD_BEEF;
/// Only supported protocol version.
pub const VERSION: u16 = 1;
/// Exact encoded size of a [`FrameHeader`].
pub const HEADER_SIZE: usize = 48;

pub type FrameHeaderBytes = [u8; HEADER_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u16,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub payload_size: u32,
    pub timestamp: u64,
    pub flags: FrameFlags,
}

impl FrameHeader {
    pub fn new(sequence: u16, width: u32, height: u32, stride: u32, payload_size: u32) -> Self {
        Self {
            sequence,
            width,
            height,
            stride,
            payload_size,
            timestamp: now_millis(),
            flags: FrameFlags::empty(),
        }
    }

    /// Upper bound on a raw payload for these dimensions.
    pub fn raw_capacity(&self) -> u64 {
        self.stride as u64 * self.height as u64
    }

    pub fn to_bytes(&self) -> FrameHeaderBytes {
        let mut buf: FrameHeaderBytes = [0; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&self.sequence.to_le_bytes());
        buf[8..12].copy_from_slice(&self.width.to_le_bytes());
        buf[12..16].copy_from_slice(&self.height.to_le_bytes());
        buf[16..20].copy_from_slice(&self.stride.to_le_bytes());
        buf[20..24].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[32] = self.flags.bits();
        buf
    }

    /// Parse and validate the magic and version fields.
    ///
    /// Length consistency against the datagram is checked by the codec,
    /// which knows how many payload bytes actually followed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StreamError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StreamError::MalformedPacket("shorter than frame header"));
        }
        if read_u32(bytes, 0) != MAGIC {
            return Err(StreamError::MalformedPacket("bad magic"));
        }
        if read_u16(bytes, 4) != VERSION {
            return Err(StreamError::MalformedPacket("unsupported version"));
        }

        Ok(Self {
            sequence: read_u16(bytes, 6),
            width: read_u32(bytes, 8),
            height: read_u32(bytes, 12),
            stride: read_u32(bytes, 16),
            payload_size: read_u32(bytes, 20),
            timestamp: read_u64(bytes, 24),
            flags: FrameFlags::from_bits_retain(bytes[32]),
        })
    }
}

/// Milliseconds since the UNIX epoch, saturating to 0 on a clock before 1970.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FrameHeader {
        FrameHeader {
            sequence: 65535,
            width: 1920,
            height: 1080,
            stride: 7680,
            payload_size: 4096,
            timestamp: 1_700_000_000_123,
            flags: FrameFlags::KEYFRAME | FrameFlags::ENCODED,
        }
    }

    #[test]
    fn layout_is_bit_exact() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes.len(), 48);
        assert_eq!(&bytes[0..4], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(&bytes[4..6], &[1, 0]);
        assert_eq!(&bytes[6..8], &[0xFF, 0xFF]);
        assert_eq!(&bytes[16..20], &7680u32.to_le_bytes());
        assert_eq!(bytes[32], 0x03);
        assert!(bytes[33..].iter().all(|&b| b == 0));
    }

    #[test]
    fn header_roundtrip() {
        let hdr = sample();
        let decoded = FrameHeader::from_bytes(&hdr.to_bytes()).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample().to_bytes();
        bytes[0] = 0x00;
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(StreamError::MalformedPacket("bad magic"))
        ));
    }

    #[test]
    fn rejects_other_version() {
        let mut bytes = sample().to_bytes();
        bytes[4..6].copy_from_slice(&2u16.to_le_bytes());
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(StreamError::MalformedPacket(_))
        ));
    }

    #[test]
    fn rejects_short_input() {
        assert!(FrameHeader::from_bytes(&[0u8; 47]).is_err());
    }

    #[test]
    fn reserved_bytes_are_ignored_on_decode() {
        let mut bytes = sample().to_bytes();
        bytes[40] = 0x7F;
        assert_eq!(FrameHeader::from_bytes(&bytes).unwrap(), sample());
    }
}
