//! Service bootstrap and the handle used to observe and stop it.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use spiwire_frame::{FramePool, PooledFrame};
use spiwire_spi::{PipelineStats, SpiBus, SpiPipeline};
use tracing::{debug, info};

use crate::config::{ServiceConfig, REACTOR_TASK_NAME};
use crate::error::{Result, ServiceError};
use crate::management::{ManagementChannel, ManagementHandle};
use crate::network::NetworkProbe;
use crate::reactor::{Reactor, ReactorShared};
use crate::stats::{SessionStats, TelemetryRecord};

/// Entry point for starting the service threads.
pub struct Service;

impl Service {
    /// Allocate the frame pool, start the SPI pipeline and spawn the reactor.
    ///
    /// Any failure here is fatal for the service and is not retried.
    pub fn start<S, P>(config: ServiceConfig, bus: S, probe: P) -> Result<ServiceHandle>
    where
        S: SpiBus,
        P: NetworkProbe,
    {
        config.validate()?;

        let pool = Arc::new(FramePool::with_capacity(
            config.frame_count,
            config.frame_size,
        )?);
        let pipeline = Arc::new(SpiPipeline::start(config.spi.pipeline_config(), bus)?);
        let channel = Arc::new(ManagementChannel::new(config.management_capacity)?);
        let shared = Arc::new(ReactorShared::default());

        let reactor = Reactor::new(
            config.clone(),
            probe,
            Arc::clone(&pool),
            Arc::clone(&pipeline),
            Arc::clone(&channel),
            Arc::clone(&shared),
        );

        let mut builder = thread::Builder::new().name(REACTOR_TASK_NAME.into());
        if let Some(stack_size) = config.reactor_stack_size {
            builder = builder.stack_size(stack_size);
        }
        let reactor = builder
            .spawn(move || reactor.run())
            .map_err(ServiceError::Spawn)?;

        info!(
            port = config.port,
            frame_size = config.frame_size,
            frame_count = config.frame_count,
            "service started"
        );
        Ok(ServiceHandle {
            shared,
            channel,
            pool,
            pipeline,
            reactor: Some(reactor),
            started: Instant::now(),
        })
    }
}

/// Handle to a running service. Dropping it shuts the service down.
pub struct ServiceHandle {
    shared: Arc<ReactorShared>,
    channel: Arc<ManagementChannel>,
    pool: Arc<FramePool>,
    pipeline: Arc<SpiPipeline<PooledFrame>>,
    reactor: Option<JoinHandle<()>>,
    started: Instant,
}

impl ServiceHandle {
    /// Submission handle for the management channel.
    pub fn management(&self) -> ManagementHandle {
        ManagementHandle::new(Arc::clone(&self.channel))
    }

    /// Block until the listener is bound, up to `timeout`.
    pub fn wait_listening(&self, timeout: Duration) -> Option<SocketAddr> {
        self.shared.wait_listening(timeout)
    }

    /// Bound listener address, if launched.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.listening()
    }

    /// Counters for connected sessions, as of the last reactor cycle.
    pub fn session_stats(&self) -> Vec<SessionStats> {
        self.shared.sessions()
    }

    /// Restart every session's byte accounting on the next reactor cycle.
    pub fn reset_byte_counters(&self) {
        self.shared.reset_counters.store(true, Ordering::Release);
        self.channel.wake();
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// Free frames in the pool.
    pub fn pool_available(&self) -> usize {
        self.pool.available()
    }

    pub fn telemetry(&self) -> TelemetryRecord {
        TelemetryRecord {
            uptime_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            pool_available: self.pool.available(),
            pool_capacity: self.pool.capacity(),
            pipeline: self.pipeline.stats(),
            sessions: self.session_stats(),
        }
    }

    /// A cloneable trigger that asks the service to stop.
    pub fn stopper(&self) -> Stopper {
        Stopper {
            shared: Arc::clone(&self.shared),
            channel: Arc::clone(&self.channel),
        }
    }

    /// Whether a stop was requested.
    pub fn is_stopping(&self) -> bool {
        self.shared.quit.load(Ordering::Acquire)
    }

    /// Stop the reactor, then the SPI pipeline, and join both threads.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(reactor) = self.reactor.take() else {
            return Ok(());
        };
        self.stopper().stop();
        reactor.join().map_err(|_| ServiceError::ReactorPanicked)?;
        self.pipeline.shutdown()?;
        debug!(pool_available = self.pool.available(), "service stopped");
        Ok(())
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(error = %err, "service shutdown failed");
        }
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("local_addr", &self.local_addr())
            .field("running", &self.reactor.is_some())
            .finish()
    }
}

/// Requests a service stop from any thread, e.g. a signal handler.
#[derive(Debug, Clone)]
pub struct Stopper {
    shared: Arc<ReactorShared>,
    channel: Arc<ManagementChannel>,
}

impl Stopper {
    pub fn stop(&self) {
        self.shared.quit.store(true, Ordering::Release);
        self.channel.wake();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use spiwire_spi::NullBus;

    use super::*;
    use crate::network::AlwaysReady;

    fn config() -> ServiceConfig {
        ServiceConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            max_wait: Duration::from_millis(50),
            min_wait: Duration::from_millis(1),
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn start_listen_and_shutdown() {
        let mut handle = Service::start(config(), NullBus, AlwaysReady).unwrap();
        let addr = handle.wait_listening(Duration::from_secs(5)).unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(handle.pool_available(), 3);

        handle.shutdown().unwrap();
        assert!(handle.local_addr().is_none());
        assert!(matches!(
            handle.management().submit(b"late"),
            Err(ServiceError::ManagementClosed)
        ));
        handle.shutdown().unwrap();
    }

    #[test]
    fn invalid_config_fails_start() {
        let cfg = ServiceConfig {
            frame_size: 0,
            ..config()
        };
        let err = Service::start(cfg, NullBus, AlwaysReady).unwrap_err();
        assert!(matches!(err, ServiceError::Config(_)));
    }

    #[test]
    fn stopper_ends_reactor() {
        let mut handle = Service::start(config(), NullBus, AlwaysReady).unwrap();
        handle.wait_listening(Duration::from_secs(5)).unwrap();

        let stopper = handle.stopper();
        thread::spawn(move || stopper.stop()).join().unwrap();
        assert!(handle.is_stopping());
        handle.shutdown().unwrap();
    }

    #[test]
    fn telemetry_reflects_pool() {
        let handle = Service::start(config(), NullBus, AlwaysReady).unwrap();
        let record = handle.telemetry();
        assert_eq!(record.pool_capacity, 3);
        assert_eq!(record.pool_available, 3);
        assert!(record.sessions.is_empty());
    }
}
