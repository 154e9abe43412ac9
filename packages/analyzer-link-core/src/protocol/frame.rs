//! Byte-stuffed framing for requests sent to an analyzer.
//!
//! ```text
//! ┌────────────┬──────────────────────────┬────────────┐
//! │ 0x55 0xAA  │ escaped payload          │ 0xAA 0x55  │
//! └────────────┴──────────────────────────┴────────────┘
//! ```
//!
//! Any payload byte equal to `0xAA`, `0x55` or the escape byte `0xF0` is sent as
//! the pair `0xF0, byte ^ 0xF0`. The escaped body therefore never contains a raw
//! marker byte, so the end marker is unambiguous.
//!
//! # Pattern
//!
//! ```
//! use analyzer_link_core::protocol::{decode_frame, OutputPacket};
//!
//! let mut pkt = OutputPacket::new();
//! pkt.add_byte(0).add_u16(4045).add_str("ok");
//! let frame = pkt.serialize();
//! assert_eq!(decode_frame(&frame), pkt.payload());
//! ```

/// Frame start marker
pub const FRAME_START: [u8; 2] = [0x55, 0xAA];

/// Frame end marker
pub const FRAME_END: [u8; 2] = [0xAA, 0x55];

/// Escape trigger; the following byte is XOR-ed with this value
pub const ESCAPE_BYTE: u8 = 0xF0;

#[inline]
fn needs_escape(byte: u8) -> bool {
    matches!(byte, 0xAA | 0x55 | ESCAPE_BYTE)
}

/// Length of `payload` once framed and escaped.
pub fn framed_len(payload: &[u8]) -> usize {
    payload.len() + FRAME_START.len() + FRAME_END.len()
        + payload.iter().filter(|&&b| needs_escape(b)).count()
}

/// Wrap `payload` in start/end markers, escaping reserved bytes.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(framed_len(payload));
    out.extend_from_slice(&FRAME_START);
    for &byte in payload {
        if needs_escape(byte) {
            out.push(ESCAPE_BYTE);
            out.push(byte ^ ESCAPE_BYTE);
        } else {
            out.push(byte);
        }
    }
    out.extend_from_slice(&FRAME_END);
    out
}

/// Reverse [`encode_frame`].
///
/// Total over any input: markers are stripped only when present, and a dangling
/// escape byte at the very end is kept as a literal.
pub fn decode_frame(frame: &[u8]) -> Vec<u8> {
    let body = frame.strip_prefix(&FRAME_START[..]).unwrap_or(frame);
    let body = body.strip_suffix(&FRAME_END[..]).unwrap_or(body);

    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.iter().copied();
    while let Some(byte) = bytes.next() {
        if byte == ESCAPE_BYTE {
            match bytes.next() {
                Some(escaped) => out.push(escaped ^ ESCAPE_BYTE),
                None => out.push(byte),
            }
        } else {
            out.push(byte);
        }
    }
    out
}

/// Fixed-layout records that can be appended to an [`OutputPacket`].
pub trait WireStruct {
    /// Append the raw (unescaped) little-endian layout of `self`.
    fn write_to(&self, out: &mut Vec<u8>);
}

/// Reusable payload builder for outgoing requests.
///
/// Numbers are little-endian, strings are raw UTF-8 without terminator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputPacket {
    payload: Vec<u8>,
}

impl OutputPacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_byte(&mut self, value: u8) -> &mut Self {
        self.payload.push(value);
        self
    }

    pub fn add_bytes(&mut self, values: &[u8]) -> &mut Self {
        self.payload.extend_from_slice(values);
        self
    }

    pub fn add_u16(&mut self, value: u16) -> &mut Self {
        self.payload.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn add_u32(&mut self, value: u32) -> &mut Self {
        self.payload.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn add_str(&mut self, value: &str) -> &mut Self {
        self.payload.extend_from_slice(value.as_bytes());
        self
    }

    pub fn add_struct<S: WireStruct>(&mut self, value: &S) -> &mut Self {
        value.write_to(&mut self.payload);
        self
    }

    /// Unframed payload accumulated so far
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn clear(&mut self) {
        self.payload.clear();
    }

    /// Framed bytes ready for the wire
    pub fn serialize(&self) -> Vec<u8> {
        encode_frame(&self.payload)
    }
}
