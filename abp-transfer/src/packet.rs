//! Wire-format definitions for protocol datagrams.
//!
//! Every datagram exchanged between sender and receiver is a [`Packet`].  This
//! module is responsible for:
//! - Defining the on-wire binary layout (checksum, length, flags, payload).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Verifying and deserialising a raw byte slice back into a [`Packet`],
//!   returning errors for corrupt, malformed or truncated input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Checksum                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            Length             |             Flags             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The checksum is a CRC32 over bytes `[4, 8 + length)`: everything except
//! the checksum field itself.  Bytes past `8 + length` are ignored; the payload
//! boundary is derived purely from the length field.

use crc::{Algorithm, Crc};
use thiserror::Error;

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// The payload carries the destination filename.
    pub const FILENAME: u16 = 0x1;
    /// The alternating (sequence) bit.
    pub const ALTERNATING: u16 = 0x2;
    /// Final chunk of the file; the payload may still carry data.
    pub const FIN: u16 = 0x4;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 8;

/// Largest datagram either side ever sends or expects.
///
/// 512 bytes keeps every datagram below the 576-byte minimum IPv4 MTU once the
/// UDP and IP headers are added.
pub const MAX_DATAGRAM: usize = 512;

/// Largest payload that fits in a [`MAX_DATAGRAM`]-sized packet.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_LEN;

// Byte offsets of each field within the serialised header.
const OFF_CHECKSUM: usize = 0;
const OFF_LENGTH: usize = 4;
const OFF_FLAGS: usize = 6;

/// CRC32 with the reflected polynomial `0xD5828281` (`0x814141AB` in normal
/// form), initial value and final XOR `0xFFFFFFFF`.
pub const CRC_32_ABP: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x8141_41ab,
    init: 0xffff_ffff,
    refin: true,
    refout: true,
    xorout: 0xffff_ffff,
    check: 0xa9cc_8179,
    residue: 0x4ac2_a509,
};

static CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ABP);

/// Compute the packet checksum over `covered`, which must be the serialised
/// packet **without** its leading checksum field.
pub fn checksum(covered: &[u8]) -> u32 {
    CRC.checksum(covered)
}

/// Fixed-size protocol header.
///
/// Fields are in host byte order; [`Header::encode`] converts to big-endian
/// on the wire and [`Header::decode`] converts back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// CRC32 over length, flags and payload.
    pub checksum: u32,
    /// Length of the payload in bytes.
    pub length: u16,
    /// Bitmask of [`flags`] constants.
    pub flags: u16,
}

impl Header {
    /// Serialise the header alone (no payload) into its fixed-width form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[OFF_CHECKSUM..OFF_LENGTH].copy_from_slice(&self.checksum.to_be_bytes());
        buf[OFF_LENGTH..OFF_FLAGS].copy_from_slice(&self.length.to_be_bytes());
        buf[OFF_FLAGS..HEADER_LEN].copy_from_slice(&self.flags.to_be_bytes());
        buf
    }

    /// Parse the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// No checksum or length validation happens here; see [`verify`].
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let raw: &[u8; HEADER_LEN] = buf
            .get(..HEADER_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(PacketError::BufferTooShort)?;

        Ok(Header {
            checksum: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            length: u16::from_be_bytes([raw[4], raw[5]]),
            flags: u16::from_be_bytes([raw[6], raw[7]]),
        })
    }
}

/// Return the checksummed region `[4, 8 + length)` of `buf`, or `None` when the
/// header is truncated or `length` points past the end of the buffer.
fn covered_region(buf: &[u8], length: u16) -> Option<&[u8]> {
    let length = usize::from(length);
    if length > MAX_PAYLOAD {
        return None;
    }
    buf.get(OFF_LENGTH..HEADER_LEN + length)
}

/// Check that `buf` holds a well-formed, uncorrupted packet.
///
/// Returns `false` (never panics) when the buffer is shorter than a header,
/// when the length field exceeds either [`MAX_PAYLOAD`] or the bytes actually
/// present, or when the recomputed checksum differs from the stored one.
pub fn verify(buf: &[u8]) -> bool {
    let Ok(header) = Header::decode(buf) else {
        return false;
    };
    match covered_region(buf, header.length) {
        Some(covered) => checksum(covered) == header.checksum,
        None => false,
    }
}

/// A complete protocol datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet with `flags` around `payload`, filling in the length
    /// and checksum header fields.
    pub fn new(flags: u16, payload: Vec<u8>) -> Result<Self, PacketError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }
        let mut packet = Packet {
            header: Header {
                checksum: 0,
                length: payload.len() as u16,
                flags,
            },
            payload,
        };
        let bytes = packet.encode();
        packet.header.checksum = checksum(&bytes[OFF_LENGTH..]);
        Ok(packet)
    }

    /// Build a zero-payload acknowledgement carrying `flags`.
    pub fn ack(flags: u16) -> Self {
        let header = Header {
            checksum: 0,
            length: 0,
            flags,
        };
        let checksum = checksum(&header.encode()[OFF_LENGTH..]);
        Packet {
            header: Header { checksum, ..header },
            payload: Vec::new(),
        }
    }

    /// The header's flag bits.
    pub fn flags(&self) -> u16 {
        self.header.flags
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// The header is written exactly as stored; packets built through
    /// [`Packet::new`] or [`Packet::ack`] always carry a valid checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Verify and parse a [`Packet`] from a raw datagram.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the length field exceeds [`MAX_PAYLOAD`] or the bytes present, or
    /// - the checksum does not verify.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let header = Header::decode(buf)?;
        let covered = covered_region(buf, header.length).ok_or(PacketError::LengthOutOfRange {
            length: header.length,
            available: buf.len() - HEADER_LEN,
        })?;

        let computed = checksum(covered);
        if computed != header.checksum {
            return Err(PacketError::ChecksumFailed {
                stored: header.checksum,
                computed,
            });
        }

        Ok(Packet {
            header,
            payload: covered[HEADER_LEN - OFF_LENGTH..].to_vec(),
        })
    }
}

/// Errors that can arise when building or parsing a datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the fixed header size.
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    /// The length field points past the payload limit or the received bytes.
    #[error("length field {length} exceeds the {available} payload bytes available")]
    LengthOutOfRange { length: u16, available: usize },
    /// Checksum did not match recomputed value.
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumFailed { stored: u32, computed: u32 },
    /// A payload of this many bytes does not fit in one datagram.
    #[error("payload of {0} bytes exceeds the {max}-byte limit", max = MAX_PAYLOAD)]
    PayloadTooLarge(usize),
}
