//! Service configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! Durations are written in milliseconds.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spiwire_frame::{DEFAULT_FRAME_COUNT, DEFAULT_FRAME_SIZE};
use spiwire_spi::PipelineConfig;

use crate::error::{Result, ServiceError};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 6000;

/// Reactor thread name.
pub const REACTOR_TASK_NAME: &str = "sinsvc2";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Concurrent client sessions; further connections are rejected.
    pub max_sessions: usize,
    pub frame_size: usize,
    pub frame_count: usize,
    /// Per-session outgoing buffer.
    pub response_capacity: usize,
    /// Management store shared by all submitters.
    pub management_capacity: usize,
    #[serde(with = "duration_ms")]
    pub accept_idle: Duration,
    #[serde(with = "duration_ms")]
    pub client_idle: Duration,
    #[serde(with = "duration_ms")]
    pub management_idle: Duration,
    /// Sleep when the network is not up yet or nothing is registered.
    #[serde(with = "duration_ms")]
    pub retry_interval: Duration,
    #[serde(with = "duration_ms")]
    pub interrupted_backoff: Duration,
    /// Sleep after a failed wait, before rebuilding every socket.
    #[serde(with = "duration_ms")]
    pub failure_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub min_wait: Duration,
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,
    /// Minimum spacing of per-session throughput log lines.
    #[serde(with = "duration_ms")]
    pub throughput_interval: Duration,
    #[serde(with = "duration_ms::option")]
    pub telemetry_interval: Option<Duration>,
    pub reactor_stack_size: Option<usize>,
    pub spi: SpiSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_sessions: 1,
            frame_size: DEFAULT_FRAME_SIZE,
            frame_count: DEFAULT_FRAME_COUNT,
            response_capacity: 128,
            management_capacity: 2048,
            accept_idle: Duration::from_secs(10),
            client_idle: Duration::from_secs(10),
            management_idle: Duration::from_secs(10),
            retry_interval: Duration::from_secs(1),
            interrupted_backoff: Duration::from_millis(500),
            failure_backoff: Duration::from_secs(5),
            min_wait: Duration::from_millis(100),
            max_wait: Duration::from_secs(10),
            throughput_interval: Duration::from_secs(1),
            telemetry_interval: None,
            reactor_stack_size: None,
            spi: SpiSettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ServiceError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|source| ServiceError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject sizes and counts the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("max_sessions", self.max_sessions),
            ("frame_size", self.frame_size),
            ("frame_count", self.frame_count),
            ("response_capacity", self.response_capacity),
            ("management_capacity", self.management_capacity),
            ("spi.chunk_size", self.spi.chunk_size),
            ("spi.queue_depth", self.spi.queue_depth),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ServiceError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.frame_size > u32::MAX as usize {
            return Err(ServiceError::Config(format!(
                "frame_size {} exceeds the wire length field",
                self.frame_size
            )));
        }
        if self.min_wait > self.max_wait {
            return Err(ServiceError::Config(
                "min_wait must not exceed max_wait".into(),
            ));
        }
        Ok(())
    }

    /// Address the listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

/// SPI pipeline section of [`ServiceConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpiSettings {
    pub chunk_size: usize,
    pub queue_depth: usize,
    #[serde(with = "duration_ms")]
    pub idle_wake: Duration,
    #[serde(with = "duration_ms")]
    pub in_flight_poll: Duration,
    pub stack_size: Option<usize>,
}

impl Default for SpiSettings {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            chunk_size: pipeline.chunk_size,
            queue_depth: pipeline.queue_depth,
            idle_wake: pipeline.idle_wake,
            in_flight_poll: pipeline.in_flight_poll,
            stack_size: pipeline.stack_size,
        }
    }
}

impl SpiSettings {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            chunk_size: self.chunk_size,
            queue_depth: self.queue_depth,
            idle_wake: self.idle_wake,
            in_flight_poll: self.in_flight_poll,
            stack_size: self.stack_size,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}
