use std::io::{ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{encode_frame, FrameHeader, DEFAULT_FRAME_SIZE, HEADER_SIZE};
use crate::error::{FrameError, Result};

/// Writes complete frames to any `Write` stream.
///
/// This is the host side of the protocol: it produces what the device's
/// decoder consumes.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    max_payload_size: usize,
}

impl<T: Write> FrameWriter<T> {
    /// Create a frame writer limited to the default frame size.
    pub fn new(inner: T) -> Self {
        Self::with_max_payload(inner, DEFAULT_FRAME_SIZE)
    }

    /// Create a frame writer with an explicit payload limit.
    pub fn with_max_payload(inner: T, max_payload_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(HEADER_SIZE + max_payload_size.min(64 * 1024)),
            max_payload_size,
        }
    }

    /// Encode and send one frame (blocking).
    pub fn send(&mut self, tag: u32, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload_size,
            });
        }

        self.buf.clear();
        encode_frame(tag, payload, &mut self.buf)?;
        self.write_buffered()?;
        self.flush()
    }

    /// Send a header without payload, for callers that stream the payload
    /// themselves with [`FrameWriter::send_raw`].
    pub fn send_header(&mut self, header: FrameHeader) -> Result<()> {
        self.buf.clear();
        header.encode(&mut self.buf);
        self.write_buffered()
    }

    /// Write raw bytes unframed.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.clear();
        self.buf.extend_from_slice(bytes);
        self.write_buffered()?;
        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    fn write_buffered(&mut self) -> Result<()> {
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        Ok(())
    }
}
