/// Errors that can occur while staging or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The declared payload exceeds the frame buffer capacity.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame buffer could not be allocated.
    #[error("failed to allocate {bytes} bytes of frame buffers")]
    AllocFailed { bytes: usize },

    /// A cursor window outside the buffer was requested.
    #[error("invalid buffer window {pos}..{limit} (capacity {cap})")]
    InvalidWindow { pos: usize, limit: usize, cap: usize },

    /// Pool geometry is unusable.
    #[error("invalid pool configuration: {0}")]
    InvalidPool(String),
}

pub type Result<T> = std::result::Result<T, FrameError>;
