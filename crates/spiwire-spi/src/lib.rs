//! SPI transfer pipeline for spiwire.
//!
//! Requests are queued by any thread and consumed by one dedicated task that
//! owns the bus. Payloads are split into fixed-size chunks; one chunk is in
//! flight at a time and its completion is reported back through a
//! [`ChunkDone`] notifier. Each request's completion callback fires exactly
//! once, including for requests still queued at shutdown.

pub mod bus;
pub mod error;
pub mod pipeline;

pub use bus::{ChunkDone, CompletionMode, DeviceBus, NullBus, Recording, RecordingBus, SpiBus};
pub use error::{Result, SpiError};
pub use pipeline::{PipelineConfig, PipelineStats, SpiPipeline, SpiRequest};
