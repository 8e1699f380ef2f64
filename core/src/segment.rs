//! Segmentation layer — MTU-bounded slicing of serialized packets
//!
//! The data path hands whole serialized packets to [`split`], which yields
//! chunks no larger than the active adapter's MTU. The receiving side feeds
//! chunks to a [`Reassembler`] until the length declared in the packet header
//! is reached; only then does a whole packet travel up to the codec layer.
//! A reassembler holds at most one in-flight packet per transport channel.

use crate::protocol::{PacketHeader, ProtocolCodec, PROTOCOL_HEADER_SIZE};
use thiserror::Error;
use tracing::warn;

/// Errors for segmentation and reassembly
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    #[error("Segment reassembly mismatch: {0}")]
    ReassemblyMismatch(String),

    #[error("Invalid MTU: {0}")]
    InvalidMtu(usize),
}

/// One MTU-bounded slice of a serialized packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    /// Byte offset of this chunk within the serialized packet
    pub offset: usize,
    /// Total serialized packet length
    pub total_len: usize,
    /// Chunk bytes, `chunk.len() <= mtu`
    pub chunk: &'a [u8],
}

/// Number of chunks a packet of `len` bytes needs at the given MTU
pub fn segment_count(len: usize, mtu: usize) -> usize {
    if mtu == 0 {
        return 0;
    }
    len.div_ceil(mtu)
}

/// Split a serialized packet into in-order MTU-bounded segments
pub fn split(packet: &[u8], mtu: usize) -> Result<Vec<Segment<'_>>, SegmentError> {
    if mtu == 0 {
        return Err(SegmentError::InvalidMtu(mtu));
    }
    let total_len = packet.len();
    Ok(packet
        .chunks(mtu)
        .enumerate()
        .map(|(index, chunk)| Segment {
            offset: index * mtu,
            total_len,
            chunk,
        })
        .collect())
}

/// A reassembled packet ready for the codec layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledPacket {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

/// Accumulates chunks until the declared packet length is reached
///
/// The first chunk of a packet goes through [`begin`](Self::begin), every
/// following chunk through [`push`](Self::push). The declared length becomes
/// known once the 6-byte header has accumulated, so the MTU may be smaller
/// than the header itself. Either call discards the in-flight state and
/// resets on error, so a malformed packet is fatal only to itself.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
    header: Option<PacketHeader>,
    started: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a packet is currently being reassembled
    pub fn in_flight(&self) -> bool {
        self.started
    }

    /// Discard any in-flight state
    pub fn reset(&mut self) {
        self.buf.clear();
        self.header = None;
        self.started = false;
    }

    /// Start reassembling a new packet from its first chunk
    ///
    /// Calling this while a prior packet is still incomplete is a reassembly
    /// mismatch: the prior packet is discarded and the error reported.
    pub fn begin(&mut self, first_chunk: &[u8]) -> Result<Option<ReassembledPacket>, SegmentError> {
        if self.started {
            let got = self.buf.len();
            let wanted = self
                .header
                .map(|h| PROTOCOL_HEADER_SIZE + h.len as usize)
                .unwrap_or(0);
            self.reset();
            warn!(got, wanted, "new packet started before prior finished reassembly");
            return Err(SegmentError::ReassemblyMismatch(format!(
                "new packet started with {got}/{wanted} prior bytes pending"
            )));
        }
        self.started = true;
        self.accumulate(first_chunk)
    }

    /// Append a continuation chunk to the in-flight packet
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<ReassembledPacket>, SegmentError> {
        if !self.started {
            return self.begin(chunk);
        }
        self.accumulate(chunk)
    }

    fn accumulate(&mut self, chunk: &[u8]) -> Result<Option<ReassembledPacket>, SegmentError> {
        self.buf.extend_from_slice(chunk);

        if self.header.is_none() {
            // Fails only while fewer than 6 bytes are buffered.
            if let Ok(header) = ProtocolCodec::parse_header(&self.buf) {
                self.header = Some(header);
            }
        }

        let Some(header) = self.header else {
            // Still inside a partial header; keep accumulating.
            return Ok(None);
        };
        let expected = PROTOCOL_HEADER_SIZE + header.len as usize;

        if self.buf.len() > expected {
            let got = self.buf.len();
            self.reset();
            warn!(got, expected, "reassembly overflowed declared packet length");
            return Err(SegmentError::ReassemblyMismatch(format!(
                "accumulated {got} bytes, declared {expected}"
            )));
        }

        if self.buf.len() < expected {
            return Ok(None);
        }

        let payload = self.buf[PROTOCOL_HEADER_SIZE..].to_vec();
        self.reset();
        Ok(Some(ReassembledPacket { header, payload }))
    }
}
