//! Serializable counters exposed through the service handle and the
//! periodic telemetry record.

use std::net::SocketAddr;

use serde::Serialize;
use spiwire_spi::PipelineStats;

/// Counters for one connected client session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub slot: usize,
    pub peer: Option<SocketAddr>,
    /// Bytes received since accept or the last counter reset.
    pub bytes_received: u64,
    pub frames_submitted: u64,
    /// Read events skipped because the frame pool was exhausted.
    pub stalls: u64,
    pub connected_ms: u64,
    /// Average receive rate over the current accounting window.
    pub kbps: f64,
    /// Outgoing bytes waiting in the response buffer.
    pub pending_output: usize,
}

/// One telemetry line pushed to clients through the management channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub uptime_ms: u64,
    pub pool_available: usize,
    pub pool_capacity: usize,
    pub pipeline: PipelineStats,
    pub sessions: Vec<SessionStats>,
}

impl TelemetryRecord {
    /// Newline-terminated JSON.
    pub fn to_json_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}
