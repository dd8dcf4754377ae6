//! Frame staging for spiwire.
//!
//! Every frame on the wire is an 8-byte header followed by the payload:
//! - a 4-byte little-endian tag
//! - a 4-byte little-endian payload length
//!
//! Payloads are staged in fixed-size buffers borrowed from a [`FramePool`],
//! filled incrementally by a [`FrameDecoder`] across as many socket reads as
//! it takes, then handed to a [`FrameSink`].

pub mod buffer;
pub mod codec;
pub mod decoder;
pub mod error;
pub mod pool;
pub mod queue;
pub mod writer;

pub use buffer::FramedBuffer;
pub use codec::{
    encode_frame, FrameHeader, DEFAULT_FRAME_COUNT, DEFAULT_FRAME_SIZE, HEADER_SIZE,
};
pub use decoder::{FrameDecoder, FrameSink, Progress, ReadOutcome};
pub use error::{FrameError, Result};
pub use pool::{FramePool, PooledFrame};
pub use queue::{BoundedQueue, Reschedule, TryOp};
pub use writer::FrameWriter;
