//! Incremental decoder for length-prefixed frames on a non-blocking stream.
//!
//! Each readiness event performs at most one header read and, once the
//! header is complete, one payload read; a header completed by an event is
//! followed by that event's payload read. Partial progress is kept in the
//! decoder between events, so any split of the byte stream reconstructs the
//! same frames.

use std::io::{ErrorKind, Read};

use tracing::{debug, warn};

use crate::codec::{FrameHeader, HEADER_SIZE};
use crate::error::{FrameError, Result};
use crate::pool::{FramePool, PooledFrame};

/// Destination for completely decoded frames.
pub trait FrameSink {
    /// Take ownership of a decoded frame.
    ///
    /// A sink that cannot accept the frame hands it back; the decoder then
    /// returns it to the pool.
    fn submit(&mut self, frame: PooledFrame) -> std::result::Result<(), PooledFrame>;
}

impl<F> FrameSink for F
where
    F: FnMut(PooledFrame) -> std::result::Result<(), PooledFrame>,
{
    fn submit(&mut self, frame: PooledFrame) -> std::result::Result<(), PooledFrame> {
        self(frame)
    }
}

/// What one readiness event achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// No frame buffer was free; nothing was read.
    Stalled,
    /// Bytes may have been consumed but the frame is not complete yet.
    Pending,
    /// A frame was completed and handed to the sink.
    Submitted { tag: u32, len: usize },
    /// A frame was completed but the sink refused it; it went back to the pool.
    Dropped { tag: u32, len: usize },
}

/// Result of [`FrameDecoder::on_readable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes taken from the stream during this event.
    pub consumed: usize,
    pub progress: Progress,
}

/// Per-connection decoding state.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    header: [u8; HEADER_SIZE],
    header_read: usize,
    active: Option<PooledFrame>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a frame buffer is currently held by this decoder.
    pub fn has_active_frame(&self) -> bool {
        self.active.is_some()
    }

    /// Header bytes received for the frame in progress.
    pub fn header_bytes_read(&self) -> usize {
        self.header_read
    }

    /// Handle one readable event on `src`.
    ///
    /// Errors are fatal for the connection; the caller should close it and
    /// call [`FrameDecoder::release`].
    pub fn on_readable<R, S>(
        &mut self,
        src: &mut R,
        pool: &FramePool,
        sink: &mut S,
    ) -> Result<ReadOutcome>
    where
        R: Read + ?Sized,
        S: FrameSink + ?Sized,
    {
        let mut frame = match self.active.take() {
            Some(frame) => frame,
            None => match pool.pop() {
                Some(frame) => {
                    self.header_read = 0;
                    frame
                }
                None => {
                    debug!("frame pool exhausted, read deferred");
                    return Ok(ReadOutcome {
                        consumed: 0,
                        progress: Progress::Stalled,
                    });
                }
            },
        };

        let mut consumed = 0usize;

        if self.header_read < HEADER_SIZE {
            let n = match read_some(src, &mut self.header[self.header_read..]) {
                Ok(n) => n,
                Err(err) => {
                    self.active = Some(frame);
                    return Err(err);
                }
            };
            self.header_read += n;
            consumed += n;

            if self.header_read < HEADER_SIZE {
                self.active = Some(frame);
                return Ok(ReadOutcome {
                    consumed,
                    progress: Progress::Pending,
                });
            }

            let header = FrameHeader::decode(&self.header);
            let len = header.payload_len();
            let cap = frame.buffer().cap();
            if len > cap {
                self.active = Some(frame);
                return Err(FrameError::PayloadTooLarge { size: len, max: cap });
            }
            frame.set_tag(header.tag);
            if let Err(err) = frame.buffer_mut().set_window(0, len) {
                self.active = Some(frame);
                return Err(err);
            }
            debug!(tag = header.tag, len, slot = frame.slot(), "frame header decoded");

            if len == 0 {
                return Ok(self.complete(frame, consumed, pool, sink));
            }
        }

        let n = match read_some(src, frame.buffer_mut().spare_at_pos_mut()) {
            Ok(n) => n,
            Err(err) => {
                self.active = Some(frame);
                return Err(err);
            }
        };
        frame.buffer_mut().advance(n);
        consumed += n;

        if frame.buffer().is_empty() {
            return Ok(self.complete(frame, consumed, pool, sink));
        }

        self.active = Some(frame);
        Ok(ReadOutcome {
            consumed,
            progress: Progress::Pending,
        })
    }

    /// Return any held frame to the pool and forget partial progress.
    pub fn release(&mut self, pool: &FramePool) {
        if let Some(frame) = self.active.take() {
            debug!(slot = frame.slot(), "frame returned on release");
            pool.push(frame);
        }
        self.header_read = 0;
    }

    fn complete<S>(
        &mut self,
        frame: PooledFrame,
        consumed: usize,
        pool: &FramePool,
        sink: &mut S,
    ) -> ReadOutcome
    where
        S: FrameSink + ?Sized,
    {
        self.header_read = 0;
        let tag = frame.tag();
        let len = frame.payload().len();
        let progress = match sink.submit(frame) {
            Ok(()) => Progress::Submitted { tag, len },
            Err(frame) => {
                warn!(tag, len, "frame sink refused frame, returning it to the pool");
                pool.push(frame);
                Progress::Dropped { tag, len }
            }
        };
        ReadOutcome { consumed, progress }
    }
}

/// One read, with `WouldBlock` meaning "nothing yet" and EOF meaning closed.
fn read_some<R: Read + ?Sized>(src: &mut R, buf: &mut [u8]) -> Result<usize> {
    loop {
        match src.read(buf) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(0),
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
}
