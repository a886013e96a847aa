//! Packet header codec and SC16 payload handling
//!
//! All raw-byte packing lives here. The header is fixed-size with every
//! multi-byte field big-endian; the payload is a run of SC16 samples kept
//! in host byte order. Nothing in this module allocates pool memory or
//! releases buffers; it operates on caller-owned buffers only.
//!
//! Header layout (defaults: 32 bytes total, timestamp at offset 24):
//!
//! ```text
//! offset  size  field
//! 0x00    4     packet length in 32-bit words   (u32 BE)
//! 0x04    4     stream id                       (u32 BE)
//! 0x08    1     burst flags: bit0 sob, bit1 eob
//! 0x09    ..    reserved, zero
//! 0x18    8     timestamp in device ticks       (u64 BE)
//! 0x20    ..    payload (SC16 pairs, host byte order)
//! ```

use crate::error::Result;
use crate::pool::PacketBuf;

/// One complex sample: signed 16-bit I and Q, host byte order
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sc16 {
    pub i: i16,
    pub q: i16,
}

impl Sc16 {
    /// Wire size of one sample
    pub const BYTES: usize = 4;

    pub fn new(i: i16, q: i16) -> Self {
        Self { i, q }
    }
}

/// Byte offset of the burst-flag byte inside the reserved region
const FLAGS_OFFSET: usize = 8;
const FLAG_SOB: u8 = 0x01;
const FLAG_EOB: u8 = 0x02;

/// Geometry of the packet header, fixed at streamer construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VrtLayout {
    /// Total header bytes in front of the payload
    pub header_bytes: usize,
    /// Byte offset of the 64-bit timestamp
    pub tsf_offset: usize,
}

impl Default for VrtLayout {
    fn default() -> Self {
        Self {
            header_bytes: 32,
            tsf_offset: 24,
        }
    }
}

impl VrtLayout {
    /// True when the layout has room for the timestamp field
    pub fn has_tsf(&self) -> bool {
        self.tsf_offset + 8 <= self.header_bytes
    }
}

/// Fields written into (or recovered from) a packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFields {
    pub stream_id: u32,
    pub tsf_ticks: Option<u64>,
    pub sob: bool,
    pub eob: bool,
}

/// Decoded view of a received packet's header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedHeader {
    pub stream_id: u32,
    pub tsf_ticks: Option<u64>,
    pub sob: bool,
    pub eob: bool,
    /// Payload bytes following the header
    pub payload_bytes: usize,
}

/// Why a received packet failed to decode. Parse failures are counted by
/// the demux and never propagate upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Packet shorter than the configured header
    Short,
    /// Payload length is not a whole number of SC16 samples
    Misaligned,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Short => f.write_str("packet shorter than header"),
            ParseError::Misaligned => f.write_str("payload not SC16-aligned"),
        }
    }
}

/// Write a header into `dst[..layout.header_bytes]`, zeroing the reserved
/// region. The length-in-words field covers the header plus
/// `payload_bytes`, rounded up.
pub fn encode_into(
    dst: &mut [u8],
    layout: &VrtLayout,
    fields: &HeaderFields,
    payload_bytes: usize,
) {
    debug_assert!(dst.len() >= layout.header_bytes);
    let hdr = &mut dst[..layout.header_bytes];
    hdr.fill(0);

    let words = ((layout.header_bytes + payload_bytes + 3) / 4) as u32;
    hdr[0..4].copy_from_slice(&words.to_be_bytes());
    hdr[4..8].copy_from_slice(&fields.stream_id.to_be_bytes());

    if layout.header_bytes > FLAGS_OFFSET {
        let mut flags = 0u8;
        if fields.sob {
            flags |= FLAG_SOB;
        }
        if fields.eob {
            flags |= FLAG_EOB;
        }
        hdr[FLAGS_OFFSET] = flags;
    }

    if layout.has_tsf() {
        let tsf = fields.tsf_ticks.unwrap_or(0);
        hdr[layout.tsf_offset..layout.tsf_offset + 8].copy_from_slice(&tsf.to_be_bytes());
    }
}

/// Append a freshly encoded header to an empty packet buffer
pub fn encode_header(
    buf: &mut PacketBuf,
    layout: &VrtLayout,
    fields: &HeaderFields,
    payload_bytes: usize,
) -> Result<()> {
    debug_assert_eq!(buf.data_len(), 0, "header must lead the packet");
    let window = buf.append(layout.header_bytes)?;
    encode_into(window, layout, fields, payload_bytes);
    Ok(())
}

/// Mirror of [`encode_into`] over a full packet's bytes
pub fn decode_header(data: &[u8], layout: &VrtLayout) -> std::result::Result<DecodedHeader, ParseError> {
    if data.len() < layout.header_bytes {
        return Err(ParseError::Short);
    }
    let payload_bytes = data.len() - layout.header_bytes;
    if payload_bytes % Sc16::BYTES != 0 {
        return Err(ParseError::Misaligned);
    }

    let stream_id = u32::from_be_bytes(data[4..8].try_into().unwrap());
    let flags = if layout.header_bytes > FLAGS_OFFSET {
        data[FLAGS_OFFSET]
    } else {
        0
    };
    let tsf_ticks = if layout.has_tsf() {
        Some(u64::from_be_bytes(
            data[layout.tsf_offset..layout.tsf_offset + 8]
                .try_into()
                .unwrap(),
        ))
    } else {
        None
    };

    Ok(DecodedHeader {
        stream_id,
        tsf_ticks,
        sob: flags & FLAG_SOB != 0,
        eob: flags & FLAG_EOB != 0,
        payload_bytes,
    })
}

/// Copy a contiguous run of samples after whatever the buffer already
/// holds, advancing the packet length. Fails with `NoTailroom` when the
/// pool element is too small; never truncates.
pub fn append_samples(buf: &mut PacketBuf, samples: &[Sc16]) -> Result<()> {
    let window = buf.append(samples.len() * Sc16::BYTES)?;
    write_samples(window, samples);
    Ok(())
}

/// Serialize samples into a byte window, host byte order
pub fn write_samples(dst: &mut [u8], samples: &[Sc16]) {
    debug_assert_eq!(dst.len(), samples.len() * Sc16::BYTES);
    for (chunk, s) in dst.chunks_exact_mut(Sc16::BYTES).zip(samples) {
        chunk[0..2].copy_from_slice(&s.i.to_ne_bytes());
        chunk[2..4].copy_from_slice(&s.q.to_ne_bytes());
    }
}

/// Deserialize a payload byte run into samples, host byte order
pub fn read_samples(payload: &[u8]) -> Vec<Sc16> {
    payload
        .chunks_exact(Sc16::BYTES)
        .map(|chunk| Sc16 {
            i: i16::from_ne_bytes(chunk[0..2].try_into().unwrap()),
            q: i16::from_ne_bytes(chunk[2..4].try_into().unwrap()),
        })
        .collect()
}
