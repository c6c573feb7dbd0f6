//! # Packet Codec
//!
//! Every benchmark payload starts with a fixed 13-byte header:
//!
//! ```text
//! offset  0        4                12     13
//!         +--------+----------------+------+------------------+
//!         | seq:u32| timestamp:u64  | kind | filler ...       |
//!         +--------+----------------+------+------------------+
//! ```
//!
//! All fields are little-endian with no padding. The bytes after the header
//! are inert filler, `(index + sequence) % 255`, so a captured payload can be
//! recognised while debugging. End of round is signalled only by the typed
//! `kind` field; the filler is never inspected.

use serde::{Deserialize, Serialize};

/// Size of the encoded header in bytes.
pub const HEADER_SIZE: usize = 13;

/// Packet classification carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketKind {
    /// Payload that counts towards the round
    Data = 0,
    /// End-of-round sentinel
    End = 1,
}

impl PacketKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PacketKind::Data),
            1 => Some(PacketKind::End),
            _ => None,
        }
    }
}

/// Decoded header of a benchmark payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: u32,
    /// Sender clock reading in microseconds
    pub timestamp: u64,
    pub kind: PacketKind,
}

impl PacketHeader {
    pub fn new(kind: PacketKind, sequence: u32, timestamp: u64) -> Self {
        Self {
            sequence,
            timestamp,
            kind,
        }
    }

    pub fn is_end(&self) -> bool {
        self.kind == PacketKind::End
    }

    /// Write the header into the first `HEADER_SIZE` bytes of `buf`.
    ///
    /// Returns `false` without touching `buf` if it is too short.
    pub fn write_to(&self, buf: &mut [u8]) -> bool {
        if buf.len() < HEADER_SIZE {
            return false;
        }
        buf[0..4].copy_from_slice(&self.sequence.to_le_bytes());
        buf[4..12].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[12] = self.kind as u8;
        true
    }
}

/// Encode a payload of at least `size` bytes.
///
/// Sizes below `HEADER_SIZE` are raised to the header size.
pub fn encode(kind: PacketKind, sequence: u32, timestamp: u64, size: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(&mut buf, kind, sequence, timestamp, size);
    buf
}

/// Encode into an existing buffer, reusing its allocation.
pub fn encode_into(
    buf: &mut Vec<u8>,
    kind: PacketKind,
    sequence: u32,
    timestamp: u64,
    size: usize,
) {
    let size = size.max(HEADER_SIZE);
    buf.clear();
    buf.resize(size, 0);
    PacketHeader::new(kind, sequence, timestamp).write_to(buf);
    for (index, byte) in buf.iter_mut().enumerate().skip(HEADER_SIZE) {
        *byte = ((index as u64 + sequence as u64) % 255) as u8;
    }
}

/// Decode the header of `payload`.
///
/// Returns `None` for payloads shorter than the header or carrying an
/// unknown kind byte.
pub fn decode(payload: &[u8]) -> Option<PacketHeader> {
    if payload.len() < HEADER_SIZE {
        return None;
    }
    let sequence = u32::from_le_bytes(payload[0..4].try_into().ok()?);
    let timestamp = u64::from_le_bytes(payload[4..12].try_into().ok()?);
    let kind = PacketKind::from_byte(payload[12])?;
    Some(PacketHeader {
        sequence,
        timestamp,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_recovers_header_fields() {
        for size in [HEADER_SIZE, HEADER_SIZE + 1, 64, 1500, 65_536] {
            let payload = encode(PacketKind::Data, 4242, 1_700_000_000_123, size);
            assert_eq!(payload.len(), size);
            let header = decode(&payload).unwrap();
            assert_eq!(header.sequence, 4242);
            assert_eq!(header.timestamp, 1_700_000_000_123);
            assert_eq!(header.kind, PacketKind::Data);
        }

        let end = decode(&encode(PacketKind::End, 7, u64::MAX, 32)).unwrap();
        assert!(end.is_end());
        assert_eq!(end.timestamp, u64::MAX);
    }

    #[test]
    fn test_short_payloads_are_invalid() {
        for len in 0..HEADER_SIZE {
            let payload = vec![0u8; len];
            assert!(decode(&payload).is_none(), "length {} decoded", len);
        }
    }

    #[test]
    fn test_small_size_is_raised_to_header() {
        let payload = encode(PacketKind::Data, 1, 2, 3);
        assert_eq!(payload.len(), HEADER_SIZE);
        assert!(decode(&payload).is_some());
    }

    #[test]
    fn test_unknown_kind_is_invalid() {
        let mut payload = encode(PacketKind::Data, 1, 2, 20);
        payload[12] = 255;
        assert!(decode(&payload).is_none());
    }

    #[test]
    fn test_filler_pattern_is_deterministic() {
        let a = encode(PacketKind::Data, 10, 99, 300);
        let b = encode(PacketKind::Data, 10, 5, 300);
        assert_eq!(a[HEADER_SIZE..], b[HEADER_SIZE..]);
        assert_eq!(a[HEADER_SIZE], ((HEADER_SIZE + 10) % 255) as u8);
        // filler starting with 255 never turns a DATA packet into END
        assert!(a.iter().skip(HEADER_SIZE).all(|&b| b < 255));
    }

    #[test]
    fn test_layout_is_little_endian() {
        let payload = encode(PacketKind::End, 0x0102_0304, 0x0A0B_0C0D_0E0F_1011, HEADER_SIZE);
        assert_eq!(&payload[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(payload[4], 0x11);
        assert_eq!(payload[11], 0x0A);
        assert_eq!(payload[12], 1);
    }

    #[test]
    fn test_encode_into_reuses_buffer() {
        let mut buf = Vec::with_capacity(128);
        encode_into(&mut buf, PacketKind::Data, 1, 1, 100);
        let capacity = buf.capacity();
        encode_into(&mut buf, PacketKind::Data, 2, 2, 64);
        assert_eq!(buf.len(), 64);
        assert_eq!(buf.capacity(), capacity);
        assert_eq!(decode(&buf).unwrap().sequence, 2);
    }
}
