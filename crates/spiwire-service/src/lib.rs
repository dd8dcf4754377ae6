//! The spiwire device service.
//!
//! A reactor thread accepts TCP clients, decodes length-prefixed frames into
//! pooled buffers and hands them to the SPI pipeline. Bytes submitted to the
//! management channel are fanned out to every connected client.

pub mod config;
pub mod error;
pub mod management;
pub mod network;
mod reactor;
pub mod service;
pub mod session;
pub mod stats;

pub use config::{ServiceConfig, SpiSettings, DEFAULT_PORT};
pub use error::{Result, ServiceError};
pub use management::{FanOut, ManagementChannel, ManagementHandle};
pub use network::{AlwaysReady, NetworkProbe};
pub use service::{Service, ServiceHandle, Stopper};
pub use session::ClientSession;
pub use stats::{SessionStats, TelemetryRecord};
