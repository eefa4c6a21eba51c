//! Frame layout and the stream framer.
//!
//! A frame on the wire is `[op(1)][len_le16(2)][payload]` with the
//! payload capped at [`MAX_FRAME_LEN`] bytes. The [`Framer`] owns an
//! append-only accumulator: BLE notifications may split a frame across
//! several deliveries, and after a (re)connect the dongle can emit a
//! plaintext boot banner that must not be mistaken for a frame header.

use bytes::{Buf, BufMut, BytesMut};

/// Maximum accepted payload length. Anything larger in a length field
/// is treated as stream corruption, not as a real frame.
pub const MAX_FRAME_LEN: usize = 1024;

/// Bytes of header before the payload: opcode + little-endian length.
pub const FRAME_HEADER_LEN: usize = 3;

/// How far ahead the framer scans for a plausible frame start when the
/// current header is corrupt. Beyond this the buffer is assumed to be
/// non-protocol text and dropped wholesale.
const RESYNC_SCAN_WINDOW: usize = 128;

/// A complete decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Transport opcode.
    pub op: u8,
    /// Frame payload (may be empty).
    pub payload: Vec<u8>,
}

/// Errors from frame encoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("payload too large: {actual} bytes (max {MAX_FRAME_LEN})")]
    PayloadTooLarge { actual: usize },
}

/// Encode a frame for transmission.
pub fn encode_frame(op: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::PayloadTooLarge {
            actual: payload.len(),
        });
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.put_u8(op);
    out.put_u16_le(payload.len() as u16);
    out.put_slice(payload);
    Ok(out)
}

/// Accumulating stream decoder.
///
/// Feed raw notification chunks with [`Framer::push`]; complete frames
/// come back in arrival order. Incomplete trailing bytes stay buffered
/// until the next chunk. Corrupt headers trigger a bounded forward scan
/// for the next plausible frame start instead of failing the stream.
#[derive(Debug, Default)]
pub struct Framer {
    buf: BytesMut,
}

impl Framer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete frame it finishes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            if self.buf.len() < FRAME_HEADER_LEN {
                break;
            }

            let len = usize::from(u16::from_le_bytes([self.buf[1], self.buf[2]]));
            if len > MAX_FRAME_LEN {
                if !self.resync() {
                    break;
                }
                continue;
            }

            let need = FRAME_HEADER_LEN + len;
            if self.buf.len() < need {
                break;
            }

            let op = self.buf[0];
            self.buf.advance(FRAME_HEADER_LEN);
            let payload = self.buf.split_to(len).to_vec();
            out.push(Frame { op, payload });
        }

        out
    }

    /// Clear the accumulator. Called on disconnect/reconnect so stale
    /// bytes from a dead link can never prefix the next session.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Number of bytes currently buffered (raw, undecoded).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop ahead to the next plausible frame start within the scan
    /// window. Returns `false` when none is found, in which case the
    /// whole buffer was discarded as non-protocol text.
    fn resync(&mut self) -> bool {
        let scan_limit = RESYNC_SCAN_WINDOW.min(self.buf.len().saturating_sub(2));
        for pos in 1..scan_limit {
            // Real transport opcodes all have the high bit set.
            if self.buf[pos] >= 0x80 && self.plausible_frame_at(pos) {
                self.buf.advance(pos);
                return true;
            }
        }
        self.buf.clear();
        false
    }

    /// A position looks like a frame start if its length field is in
    /// range and the declared frame fits within the buffered bytes.
    fn plausible_frame_at(&self, pos: usize) -> bool {
        if pos + FRAME_HEADER_LEN > self.buf.len() {
            return false;
        }
        let len = usize::from(u16::from_le_bytes([self.buf[pos + 1], self.buf[pos + 2]]));
        len <= MAX_FRAME_LEN && pos + FRAME_HEADER_LEN + len <= self.buf.len()
    }
}
