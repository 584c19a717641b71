//! # Packet Codec
//!
//! Fixed-width datagram header and the pure encode/decode pair around it.
//!
//! ## Wire Format
//! ```text
//! [Version(1)] [ConnId(4)] [Seq(4)] [Ack(4)] [AckBits(8)] [Flags(1)]
//! [FragIndex(2)] [FragCount(2)] [PayloadLen(2)] [Payload(PayloadLen)]
//! ```
//! All integers are big-endian. `PayloadLen` covers every byte after the header,
//! including the authentication tag of encrypted datagrams.
//!
//! The encoded header doubles as the associated data of the AEAD seal, so any
//! modification of it in flight fails authentication.

use crate::config::PROTOCOL_VERSION;
use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 28;

/// Datagram kind and modifier bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    pub const HANDSHAKE: Flags = Flags(0x01);
    pub const DATA: Flags = Flags(0x02);
    pub const ACK_ONLY: Flags = Flags(0x04);
    pub const DISCONNECT: Flags = Flags(0x08);
    pub const FRAGMENT: Flags = Flags(0x10);
    pub const RESENT: Flags = Flags(0x20);

    const KNOWN: u8 = 0x3F;
    const KINDS: u8 = Self::HANDSHAKE.0 | Self::DATA.0 | Self::ACK_ONLY.0 | Self::DISCONNECT.0;

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !Self::KNOWN != 0 {
            return Err(ProtocolError::MalformedPacket(constants::ERR_UNKNOWN_FLAGS));
        }
        if (bits & Self::KINDS).count_ones() != 1 {
            return Err(ProtocolError::MalformedPacket(
                constants::ERR_CONFLICTING_FLAGS,
            ));
        }
        Ok(Flags(bits))
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn with(self, other: Flags) -> Self {
        Flags(self.0 | other.0)
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        self.with(rhs)
    }
}

/// Fixed datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    /// Identifier the recipient assigned to this connection, 0 for handshake requests.
    pub connection_id: u32,
    pub sequence: u32,
    /// Highest sequence received from the peer.
    pub ack: u32,
    /// Bit `i` set means `ack - 1 - i` was received too.
    pub ack_bits: u64,
    pub flags: Flags,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub payload_len: u16,
}

impl Header {
    /// Header for a single, unfragmented datagram.
    pub fn new(connection_id: u32, sequence: u32, flags: Flags) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            connection_id,
            sequence,
            ack: 0,
            ack_bits: 0,
            flags,
            fragment_index: 0,
            fragment_count: 1,
            payload_len: 0,
        }
    }

    /// Write the header into `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.version);
        buf.put_u32(self.connection_id);
        buf.put_u32(self.sequence);
        buf.put_u32(self.ack);
        buf.put_u64(self.ack_bits);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.fragment_index);
        buf.put_u16(self.fragment_count);
        buf.put_u16(self.payload_len);
    }

    /// Encode into a fixed array, used as AEAD associated data.
    pub fn to_array(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut slice = &mut out[..];
        self.encode(&mut slice);
        out
    }

    /// Parse and validate the header at the front of `buf`.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < HEADER_SIZE {
            return Err(ProtocolError::MalformedPacket(constants::ERR_SHORT_HEADER));
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let connection_id = buf.get_u32();
        let sequence = buf.get_u32();
        let ack = buf.get_u32();
        let ack_bits = buf.get_u64();
        let flags = Flags::from_bits(buf.get_u8())?;
        let fragment_index = buf.get_u16();
        let fragment_count = buf.get_u16();
        let payload_len = buf.get_u16();

        if fragment_count == 0 || fragment_index >= fragment_count {
            return Err(ProtocolError::MalformedPacket(constants::ERR_FRAGMENT_BOUNDS));
        }

        Ok(Self {
            version,
            connection_id,
            sequence,
            ack,
            ack_bits,
            flags,
            fragment_index,
            fragment_count,
            payload_len,
        })
    }
}

/// Serialize a header and its payload into one datagram.
///
/// The header's `payload_len` is taken from `payload`, so callers never have to
/// keep the two in sync by hand.
pub fn encode(header: &Header, payload: &[u8]) -> Result<Bytes> {
    let payload_len = u16::try_from(payload.len())
        .map_err(|_| ProtocolError::MalformedPacket(constants::ERR_PAYLOAD_TOO_LONG))?;
    let header = Header {
        payload_len,
        ..*header
    };
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Parse a datagram into its header and payload.
///
/// Fails with `MalformedPacket` when the buffer is shorter than the header or the
/// declared payload length disagrees with the bytes that follow, and with
/// `UnsupportedVersion` for an unknown version byte.
pub fn decode(datagram: &[u8]) -> Result<(Header, &[u8])> {
    let mut cursor = datagram;
    let header = Header::decode(&mut cursor)?;
    if cursor.len() != usize::from(header.payload_len) {
        return Err(ProtocolError::MalformedPacket(
            constants::ERR_LENGTH_MISMATCH,
        ));
    }
    Ok((header, cursor))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            version: PROTOCOL_VERSION,
            connection_id: 0xDEAD_BEEF,
            sequence: 42,
            ack: 41,
            ack_bits: 0b1011,
            flags: Flags::DATA | Flags::FRAGMENT,
            fragment_index: 2,
            fragment_count: 5,
            payload_len: 0,
        }
    }

    #[test]
    fn test_header_layout_is_fixed() {
        let bytes = encode(&sample_header(), &[]).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(&bytes[1..5], &0xDEAD_BEEFu32.to_be_bytes());
        assert_eq!(bytes[21], 0x12);
    }

    #[test]
    fn test_encode_decode_with_payload() {
        let header = sample_header();
        let bytes = encode(&header, b"hello").unwrap();
        let (decoded, payload) = decode(&bytes).unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(decoded.payload_len, 5);
        assert_eq!(
            decoded,
            Header {
                payload_len: 5,
                ..header
            }
        );
    }

    #[test]
    fn test_short_buffer_rejected() {
        let bytes = encode(&sample_header(), &[]).unwrap();
        assert!(matches!(
            decode(&bytes[..HEADER_SIZE - 1]),
            Err(ProtocolError::MalformedPacket(_))
        ));
        assert!(matches!(decode(&[]), Err(ProtocolError::MalformedPacket(_))));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let bytes = encode(&sample_header(), b"abc").unwrap();
        let mut longer = bytes.to_vec();
        longer.push(0);
        assert!(matches!(
            decode(&longer),
            Err(ProtocolError::MalformedPacket(_))
        ));
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = encode(&sample_header(), b"x").unwrap().to_vec();
        bytes[0] = 99;
        assert!(matches!(
            decode(&bytes),
            Err(ProtocolError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_flag_validation() {
        assert!(Flags::from_bits(0x80).is_err());
        assert!(Flags::from_bits(0).is_err());
        assert!(Flags::from_bits((Flags::DATA | Flags::DISCONNECT).bits()).is_err());
        let flags = Flags::from_bits((Flags::DATA | Flags::RESENT).bits()).unwrap();
        assert!(flags.contains(Flags::DATA));
        assert!(flags.contains(Flags::RESENT));
        assert!(!flags.contains(Flags::FRAGMENT));
    }

    #[test]
    fn test_fragment_bounds_rejected() {
        let mut header = sample_header();
        header.fragment_index = 5;
        let bytes = encode(&header, &[]).unwrap();
        assert!(matches!(
            decode(&bytes),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }
}
