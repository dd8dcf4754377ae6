use std::path::PathBuf;

use spiwire_frame::FrameError;
use spiwire_spi::SpiError;
use spiwire_transport::TransportError;

/// Errors that can occur while starting or talking to the service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Transport layer error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame staging error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// SPI pipeline error.
    #[error("SPI pipeline error: {0}")]
    Spi(#[from] SpiError),

    /// Configuration values are unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration file could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for this schema.
    #[error("failed to parse config {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The management channel has no open wake socket.
    #[error("management channel is not open")]
    ManagementClosed,

    /// The management store lock is unusable.
    #[error("management store lock unavailable")]
    ManagementLock,

    /// The submission does not fit in the management store.
    #[error("management buffer full ({requested} bytes requested, {free} free)")]
    ManagementFull { requested: usize, free: usize },

    /// The reactor task could not be spawned.
    #[error("failed to spawn reactor task: {0}")]
    Spawn(#[source] std::io::Error),

    /// The reactor task panicked.
    #[error("reactor task terminated abnormally")]
    ReactorPanicked,
}

pub type Result<T> = std::result::Result<T, ServiceError>;
