//! Control-channel message framing: a 2-byte big-endian type code, a 4-byte
//! big-endian payload length, then the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 6;

/// Incremental frame reader over a growable buffer. Bytes are pushed in as
/// they arrive from the socket; complete `(type, payload)` pairs are pulled
/// out. Partial reads are normal and yield nothing.
#[derive(Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        FrameReader {
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> Option<(u16, Bytes)> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let ty = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        let len = u32::from_be_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]) as usize;
        if self.buf.len() < HEADER_LEN + len {
            return None;
        }
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Some((ty, payload))
    }
}

/// Encode one frame; the writer sends header and payload as a single unit.
pub fn encode_frame(ty: u16, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u16(ty);
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    out.freeze()
}
