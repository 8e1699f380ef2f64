//! Protocol codec — packet framing for the data path
//!
//! Every application payload is framed into an addressed, length-prefixed
//! packet before segmentation. The wire header is 6 bytes, big-endian:
//! bytes[0..2] packet id (u16), bytes[2..6] payload length (u32), followed by
//! the payload verbatim.

use std::sync::atomic::{AtomicU16, Ordering};
use thiserror::Error;

/// Size of the serialized packet header in bytes
pub const PROTOCOL_HEADER_SIZE: usize = 6;

/// Errors for packet parsing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed header: {0} bytes available, {PROTOCOL_HEADER_SIZE} required")]
    MalformedHeader(usize),
}

/// Parsed packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Sender-assigned sequence number, wraps at 2^16
    pub id: u16,
    /// Payload byte count
    pub len: u32,
}

/// A framed packet: header plus payload
///
/// Invariant: `header.len == payload.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Total serialized size of this packet
    pub fn serialized_len(&self) -> usize {
        PROTOCOL_HEADER_SIZE + self.payload.len()
    }
}

/// Frames payloads into packets and parses them back
///
/// Each codec instance owns its own id counter; packet ids are monotonically
/// increasing modulo 2^16 across successive [`frame`](Self::frame) calls on
/// one instance. The session controller holds one codec per session, shared
/// by all data adapters, so ids are session-scoped.
#[derive(Debug, Default)]
pub struct ProtocolCodec {
    next_id: AtomicU16,
}

impl ProtocolCodec {
    /// Create a codec with the id counter at zero
    pub fn new() -> Self {
        Self {
            next_id: AtomicU16::new(0),
        }
    }

    /// Frame a payload, assigning the next sequence id
    pub fn frame(&self, payload: &[u8]) -> Packet {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Packet {
            header: PacketHeader {
                id,
                len: payload.len() as u32,
            },
            payload: payload.to_vec(),
        }
    }

    /// Serialize a packet: 6-byte header followed by the payload
    pub fn serialize(&self, packet: &Packet) -> Vec<u8> {
        let mut out = Vec::with_capacity(packet.serialized_len());
        out.extend_from_slice(&packet.header.id.to_be_bytes());
        out.extend_from_slice(&packet.header.len.to_be_bytes());
        out.extend_from_slice(&packet.payload);
        out
    }

    /// Parse just the header from a serialized packet
    pub fn parse_header(bytes: &[u8]) -> Result<PacketHeader, ProtocolError> {
        if bytes.len() < PROTOCOL_HEADER_SIZE {
            return Err(ProtocolError::MalformedHeader(bytes.len()));
        }
        let id = u16::from_be_bytes([bytes[0], bytes[1]]);
        let len = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        Ok(PacketHeader { id, len })
    }

    /// Parse a serialized packet into a caller-supplied buffer
    ///
    /// Copies `min(header.len, buf.len())` payload bytes into `buf` and
    /// returns the header; the caller compares `header.len` against its
    /// buffer capacity to detect truncation.
    pub fn parse_into(bytes: &[u8], buf: &mut [u8]) -> Result<PacketHeader, ProtocolError> {
        let header = Self::parse_header(bytes)?;
        let available = bytes.len().saturating_sub(PROTOCOL_HEADER_SIZE);
        let copy = (header.len as usize).min(buf.len()).min(available);
        buf[..copy].copy_from_slice(&bytes[PROTOCOL_HEADER_SIZE..PROTOCOL_HEADER_SIZE + copy]);
        Ok(header)
    }

    /// Parse a serialized packet into an owned [`Packet`]
    pub fn parse(bytes: &[u8]) -> Result<Packet, ProtocolError> {
        let header = Self::parse_header(bytes)?;
        let available = bytes.len().saturating_sub(PROTOCOL_HEADER_SIZE);
        let take = (header.len as usize).min(available);
        Ok(Packet {
            header,
            payload: bytes[PROTOCOL_HEADER_SIZE..PROTOCOL_HEADER_SIZE + take].to_vec(),
        })
    }
}
