use bytes::{Buf, BufMut, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: tag (4) + length (4) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Default frame buffer size: 4 KiB.
pub const DEFAULT_FRAME_SIZE: usize = 4 * 1024;

/// Default number of pooled frames: as many 4 KiB frames as fit in 15 KiB.
pub const DEFAULT_FRAME_COUNT: usize = 15 * 1024 / DEFAULT_FRAME_SIZE;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Opaque request tag, carried through to the frame.
    pub tag: u32,
    /// Payload length in bytes.
    pub len: u32,
}

impl FrameHeader {
    pub fn new(tag: u32, len: u32) -> Self {
        Self { tag, len }
    }

    /// Decode a complete 8-byte header.
    pub fn decode(src: &[u8; HEADER_SIZE]) -> Self {
        let mut src = &src[..];
        let tag = src.get_u32_le();
        let len = src.get_u32_le();
        Self { tag, len }
    }

    /// Append the wire form of this header to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u32_le(self.tag);
        dst.put_u32_le(self.len);
    }

    /// Wire form of this header.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut dst = &mut out[..];
        dst.put_u32_le(self.tag);
        dst.put_u32_le(self.len);
        out
    }

    /// Payload length as `usize`.
    pub fn payload_len(&self) -> usize {
        self.len as usize
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌───────────┬───────────┬─────────────────┐
/// │ Tag       │ Length    │ Payload         │
/// │ (4B LE)   │ (4B LE)   │ (Length bytes)  │
/// └───────────┴───────────┴─────────────────┘
/// ```
pub fn encode_frame(tag: u32, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    FrameHeader::new(tag, len).encode(dst);
    dst.put_slice(payload);
    Ok(())
}
