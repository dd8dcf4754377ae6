/// Errors raised by the SPI pipeline and its buses.
#[derive(Debug, thiserror::Error)]
pub enum SpiError {
    /// The chunk transfer buffer could not be allocated.
    #[error("failed to allocate {bytes}-byte transfer buffer")]
    AllocFailed { bytes: usize },

    /// The pipeline task could not be spawned.
    #[error("failed to spawn SPI task: {0}")]
    Spawn(#[source] std::io::Error),

    /// The bus refused or failed a transfer.
    #[error("SPI bus error: {0}")]
    Bus(#[from] std::io::Error),

    /// Pipeline configuration is unusable.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// The pipeline task terminated abnormally.
    #[error("SPI task terminated abnormally")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, SpiError>;
