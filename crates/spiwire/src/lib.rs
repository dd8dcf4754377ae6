//! Frame forwarding from TCP clients to an SPI slave link.
//!
//! Clients stream length-prefixed frames over TCP; each frame is staged in a
//! pooled buffer and transmitted by a single SPI consumer task in fixed-size
//! chunks. Bytes submitted to the management channel reach every connected
//! client.
//!
//! # Crate Structure
//!
//! - [`transport`] - Non-blocking sockets and the `select()` wait primitive
//! - [`frame`] - Wire header, framed buffers, the frame pool and decoder
//! - [`spi`] - The SPI bus seam and the chunking pipeline
//! - [`service`] - Configuration, reactor, sessions and management fan-out

/// Re-export transport types.
pub mod transport {
    pub use spiwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use spiwire_frame::*;
}

/// Re-export SPI pipeline types.
pub mod spi {
    pub use spiwire_spi::*;
}

/// Re-export service types.
pub mod service {
    pub use spiwire_service::*;
}
