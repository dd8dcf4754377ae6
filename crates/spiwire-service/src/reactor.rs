//! The socket reactor: one thread that polls the listener, the management
//! wake socket and every client session, and dispatches readiness to the
//! matching handler.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use spiwire_frame::{FramePool, FrameSink, PooledFrame, Progress, Reschedule};
use spiwire_spi::{SpiPipeline, SpiRequest};
use spiwire_transport::{Deadline, Interest, Ready, Selector, Socket, WaitError};
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::management::ManagementChannel;
use crate::network::NetworkProbe;
use crate::session::ClientSession;
use crate::stats::SessionStats;

/// Which handler a socket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Listener,
    Management,
    Client(usize),
}

/// State shared between the reactor thread and the service handle.
#[derive(Debug, Default)]
pub(crate) struct ReactorShared {
    pub(crate) quit: AtomicBool,
    pub(crate) reset_counters: AtomicBool,
    listening: Mutex<Option<SocketAddr>>,
    listening_changed: Condvar,
    sessions: Mutex<Vec<SessionStats>>,
}

impl ReactorShared {
    pub(crate) fn listening(&self) -> Option<SocketAddr> {
        *lock(&self.listening)
    }

    pub(crate) fn wait_listening(&self, timeout: Duration) -> Option<SocketAddr> {
        let guard = lock(&self.listening);
        let (guard, _) = self
            .listening_changed
            .wait_timeout_while(guard, timeout, |addr| addr.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    pub(crate) fn sessions(&self) -> Vec<SessionStats> {
        lock(&self.sessions).clone()
    }

    fn set_listening(&self, addr: Option<SocketAddr>) {
        *lock(&self.listening) = addr;
        self.listening_changed.notify_all();
    }

    fn publish_sessions(&self, stats: Vec<SessionStats>) {
        *lock(&self.sessions) = stats;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands decoded frames to the SPI pipeline; the completion callback puts
/// the frame back into the pool.
struct PipelineSink<'a> {
    pipeline: &'a SpiPipeline<PooledFrame>,
    pool: &'a Arc<FramePool>,
}

impl FrameSink for PipelineSink<'_> {
    fn submit(&mut self, frame: PooledFrame) -> std::result::Result<(), PooledFrame> {
        let pool = Arc::clone(self.pool);
        let request = SpiRequest::new(frame, move |frame| return_frame(&pool, frame));
        self.pipeline.submit(request).map_err(SpiRequest::into_payload)
    }
}

/// Completion path: never block on the pool lock unless it is contended.
fn return_frame(pool: &FramePool, frame: PooledFrame) {
    let mut hint = Reschedule::new();
    if let Err(frame) = pool.try_push(frame, &mut hint) {
        pool.push(frame);
    }
}

pub(crate) struct Reactor<P> {
    config: ServiceConfig,
    probe: P,
    listener: Socket,
    management: Socket,
    sessions: Vec<Option<ClientSession>>,
    selector: Selector,
    pool: Arc<FramePool>,
    pipeline: Arc<SpiPipeline<PooledFrame>>,
    channel: Arc<ManagementChannel>,
    shared: Arc<ReactorShared>,
    launched: bool,
}

impl<P: NetworkProbe> Reactor<P> {
    pub(crate) fn new(
        config: ServiceConfig,
        probe: P,
        pool: Arc<FramePool>,
        pipeline: Arc<SpiPipeline<PooledFrame>>,
        channel: Arc<ManagementChannel>,
        shared: Arc<ReactorShared>,
    ) -> Self {
        let sessions = (0..config.max_sessions).map(|_| None).collect();
        Self {
            config,
            probe,
            listener: Socket::closed(),
            management: Socket::closed(),
            sessions,
            selector: Selector::new(),
            pool,
            pipeline,
            channel,
            shared,
            launched: false,
        }
    }

    /// Top-level loop. Returns once the quit flag is observed.
    pub(crate) fn run(mut self) {
        info!(max_sessions = self.config.max_sessions, "reactor running");
        while !self.shared.quit.load(Ordering::Acquire) {
            self.cycle();
        }
        self.teardown();
        info!("reactor stopped");
    }

    /// One loop iteration: launch if needed, wait, dispatch.
    fn cycle(&mut self) {
        if !self.launched {
            let Some(local) = self.probe.local_address() else {
                debug!("network not ready");
                thread::sleep(self.config.retry_interval);
                return;
            };
            if let Err(err) = self.launch() {
                warn!(error = %err, local = %local, "launch failed, retrying");
                self.teardown();
                thread::sleep(self.config.retry_interval);
                return;
            }
        }

        let now = Instant::now();
        let registered = [&self.listener, &self.management]
            .into_iter()
            .chain(self.sessions.iter().flatten().map(ClientSession::socket));
        let Some(bound) = self.selector.prepare(registered, now) else {
            debug!("no sockets registered");
            thread::sleep(self.config.retry_interval);
            return;
        };

        let timeout = bound.timeout(now, self.config.min_wait, self.config.max_wait);
        match self.selector.wait(timeout) {
            Ok(_) => {}
            Err(WaitError::Interrupted) => {
                debug!("wait interrupted");
                thread::sleep(self.config.interrupted_backoff);
                return;
            }
            Err(WaitError::Failed(err)) => {
                error!(error = %err, "wait failed, rebuilding sockets");
                self.teardown();
                thread::sleep(self.config.failure_backoff);
                return;
            }
        }

        self.dispatch(Instant::now());
        self.resume_management(Instant::now());
        self.housekeeping(Instant::now());
    }

    /// Open the listener and the management wake socket.
    fn launch(&mut self) -> Result<()> {
        let mut listener = Socket::listen(self.config.listen_addr())?;
        let (mut management, wake) = Socket::wake_pair()?;
        self.channel.attach(wake)?;

        let now = Instant::now();
        listener.arm(Interest::READ, Deadline::after_from(now, self.config.accept_idle));
        management.arm(
            Interest::READ,
            Deadline::after_from(now, self.config.management_idle),
        );

        self.shared.set_listening(listener.local_addr());
        self.listener = listener;
        self.management = management;
        self.launched = true;
        debug!("reactor launched");
        Ok(())
    }

    /// Close every socket and return every held frame.
    fn teardown(&mut self) {
        self.channel.detach();
        self.listener.close();
        self.management.close();
        for slot in 0..self.sessions.len() {
            self.close_session(slot, "reactor teardown");
        }
        self.shared.set_listening(None);
        self.shared.publish_sessions(Vec::new());
        self.launched = false;
    }

    fn dispatch(&mut self, now: Instant) {
        let roles = [Role::Listener, Role::Management]
            .into_iter()
            .chain((0..self.sessions.len()).map(Role::Client));
        for role in roles {
            let ready = match self.socket(role) {
                Some(socket) => self.selector.observe(socket, now),
                None => continue,
            };
            if ready.is_empty() {
                continue;
            }
            if let Some(socket) = self.socket_mut(role) {
                socket.disarm();
            }
            match role {
                Role::Listener => self.on_listener(ready, now),
                Role::Management => self.on_management(ready, now),
                Role::Client(slot) => self.on_client(slot, ready, now),
            }
        }
    }

    fn socket(&self, role: Role) -> Option<&Socket> {
        let socket = match role {
            Role::Listener => &self.listener,
            Role::Management => &self.management,
            Role::Client(slot) => self.sessions.get(slot)?.as_ref()?.socket(),
        };
        socket.is_open().then_some(socket)
    }

    fn socket_mut(&mut self, role: Role) -> Option<&mut Socket> {
        let socket = match role {
            Role::Listener => &mut self.listener,
            Role::Management => &mut self.management,
            Role::Client(slot) => self.sessions.get_mut(slot)?.as_mut()?.socket_mut(),
        };
        socket.is_open().then_some(socket)
    }

    fn on_listener(&mut self, ready: Ready, now: Instant) {
        if ready.contains(Ready::READ) {
            match self.sessions.iter().position(Option::is_none) {
                Some(slot) => match self.listener.accept() {
                    Ok(Some(socket)) => {
                        let mut session =
                            ClientSession::new(socket, self.config.response_capacity, now);
                        session.rearm(self.config.client_idle, now);
                        info!(peer = ?session.peer(), slot, "client connected");
                        self.sessions[slot] = Some(session);
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "accept failed"),
                },
                None => match self.listener.reject() {
                    Ok(peer) => info!(peer = ?peer, "no free session slot, connection rejected"),
                    Err(err) => warn!(error = %err, "reject failed"),
                },
            }
        }
        self.listener.arm(
            Interest::READ,
            Deadline::after_from(now, self.config.accept_idle),
        );
    }

    fn on_management(&mut self, ready: Ready, now: Instant) {
        if ready.contains(Ready::READ) {
            if let Err(err) = self.management.drain_wake() {
                warn!(error = %err, "management wake drain failed");
            }
            self.fan_out_management(now);
        }
        self.management.arm(
            Interest::READ,
            Deadline::after_from(now, self.config.management_idle),
        );
    }

    fn on_client(&mut self, slot: usize, ready: Ready, now: Instant) {
        if ready.contains(Ready::TIMEOUT) {
            self.close_session(slot, "idle timeout");
            return;
        }
        let Some(session) = self.sessions.get_mut(slot).and_then(Option::as_mut) else {
            return;
        };

        if ready.contains(Ready::READ) {
            let mut sink = PipelineSink {
                pipeline: &self.pipeline,
                pool: &self.pool,
            };
            match session.on_readable(&self.pool, &mut sink, now, self.config.throughput_interval)
            {
                Ok(Progress::Submitted { tag, len }) => {
                    debug!(slot, tag, len, "frame submitted to SPI pipeline");
                }
                Ok(Progress::Dropped { tag, len }) => {
                    warn!(slot, tag, len, "SPI pipeline refused frame");
                }
                Ok(Progress::Stalled) | Ok(Progress::Pending) => {}
                Err(err) => {
                    self.close_session(slot, &err.to_string());
                    return;
                }
            }
        }

        if ready.contains(Ready::WRITE) {
            if let Err(err) = session.on_writable() {
                self.close_session(slot, &err.to_string());
                return;
            }
        }

        session.rearm(self.config.client_idle, now);
    }

    /// Copy the management store into every session and write it out,
    /// repeating while response buffers keep draining.
    fn fan_out_management(&mut self, now: Instant) {
        loop {
            let report = match self.channel.fan_out(self.sessions.iter_mut().flatten()) {
                Ok(report) => report,
                Err(err) => {
                    error!(error = %err, "management fan-out failed");
                    return;
                }
            };
            debug!(
                pending = report.pending,
                drained = report.drained,
                sessions = report.sessions,
                "management fan-out"
            );
            for slot in 0..self.sessions.len() {
                self.flush_session(slot, now);
            }
            if report.drained == 0 || report.drained == report.pending {
                return;
            }
        }
    }

    /// Continue a fan-out that stopped on a full response buffer. Sessions
    /// with pending output are armed for WRITE, so the wait wakes when one
    /// drains.
    fn resume_management(&mut self, now: Instant) {
        if self.launched && self.channel.pending() > 0 {
            self.fan_out_management(now);
        }
    }

    /// Run one session's WRITE path outside of a readiness event.
    fn flush_session(&mut self, slot: usize, now: Instant) {
        let Some(session) = self.sessions.get_mut(slot).and_then(Option::as_mut) else {
            return;
        };
        if !session.has_pending_output() {
            return;
        }
        match session.on_writable() {
            Ok(_) => {
                let interest = session.socket().interest();
                if !interest.is_empty() {
                    session.rearm(self.config.client_idle, now);
                }
            }
            Err(err) => self.close_session(slot, &err.to_string()),
        }
    }

    fn close_session(&mut self, slot: usize, reason: &str) {
        let Some(mut session) = self.sessions.get_mut(slot).and_then(Option::take) else {
            return;
        };
        info!(peer = ?session.peer(), slot, reason, "client disconnected");
        session.release(&self.pool);
    }

    /// Publish session counters and apply pending counter resets.
    fn housekeeping(&mut self, now: Instant) {
        let reset = self.shared.reset_counters.swap(false, Ordering::AcqRel);
        let mut stats = Vec::new();
        for (slot, session) in self.sessions.iter_mut().enumerate() {
            let Some(session) = session else {
                continue;
            };
            if reset {
                session.reset_byte_counters(now);
            }
            stats.push(session.stats(slot, now));
        }
        if reset {
            info!("client byte counters reset");
        }
        self.shared.publish_sessions(stats);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::{IpAddr, Ipv4Addr, TcpStream};

    use spiwire_frame::FrameWriter;
    use spiwire_spi::{CompletionMode, PipelineConfig, Recording, RecordingBus};

    use super::*;
    use crate::network::AlwaysReady;

    struct Harness<P> {
        reactor: Reactor<P>,
        recording: Recording,
        pool: Arc<FramePool>,
        channel: Arc<ManagementChannel>,
    }

    fn test_config() -> ServiceConfig {
        ServiceConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            frame_size: 64,
            frame_count: 2,
            min_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(20),
            retry_interval: Duration::from_millis(5),
            ..ServiceConfig::default()
        }
    }

    fn harness_with<P: NetworkProbe>(
        config: ServiceConfig,
        probe: P,
        mode: CompletionMode,
    ) -> Harness<P> {
        let bus = RecordingBus::new(mode);
        let recording = bus.recording();
        let pool = Arc::new(FramePool::with_capacity(config.frame_count, config.frame_size).unwrap());
        let pipeline = Arc::new(SpiPipeline::start(PipelineConfig::default(), bus).unwrap());
        let channel = Arc::new(ManagementChannel::new(config.management_capacity).unwrap());
        let reactor = Reactor::new(
            config,
            probe,
            Arc::clone(&pool),
            pipeline,
            Arc::clone(&channel),
            Arc::new(ReactorShared::default()),
        );
        Harness {
            reactor,
            recording,
            pool,
            channel,
        }
    }

    fn harness(mode: CompletionMode) -> Harness<AlwaysReady> {
        harness_with(test_config(), AlwaysReady, mode)
    }

    fn spin_until<P: NetworkProbe, F>(h: &mut Harness<P>, mut done: F)
    where
        F: FnMut(&Harness<P>) -> bool,
    {
        let started = Instant::now();
        while !done(h) {
            assert!(started.elapsed() < Duration::from_secs(5), "condition never met");
            h.reactor.cycle();
        }
    }

    fn connect<P: NetworkProbe>(h: &mut Harness<P>) -> TcpStream {
        spin_until(h, |h| h.reactor.launched);
        let addr = h.reactor.shared.listening().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        spin_until(h, |h| h.reactor.sessions.iter().any(Option::is_some));
        stream
    }

    #[test]
    fn launch_waits_for_network() {
        let mut ready = false;
        let probe = move || {
            let answer = ready.then_some(IpAddr::V4(Ipv4Addr::LOCALHOST));
            ready = true;
            answer
        };
        let mut h = harness_with(test_config(), probe, CompletionMode::Inline);

        h.reactor.cycle();
        assert!(!h.reactor.launched);
        h.reactor.cycle();
        assert!(h.reactor.launched);
        assert!(h.reactor.listener.is_open());
        assert!(h.reactor.management.is_open());
    }

    #[test]
    fn frame_reaches_bus_and_frame_returns_to_pool() {
        let mut h = harness(CompletionMode::Inline);
        let client = connect(&mut h);

        let mut writer = FrameWriter::new(client);
        writer.send(1, b"0123456789").unwrap();

        spin_until(&mut h, |h| h.recording.bytes() == b"0123456789");
        spin_until(&mut h, |h| h.pool.available() == h.pool.capacity());
    }

    #[test]
    fn exhausted_pool_stalls_without_closing() {
        let mut h = harness(CompletionMode::Manual);
        let client = connect(&mut h);
        let mut writer = FrameWriter::new(client);
        for tag in 1..=3u32 {
            writer.send(tag, b"abcd").unwrap();
        }

        spin_until(&mut h, |h| h.pool.available() == 0 && h.recording.pending() == 1);
        for _ in 0..20 {
            h.reactor.cycle();
        }
        let session = h.reactor.sessions[0].as_ref().unwrap();
        assert!(session.socket().interest().contains(Interest::READ));
        assert_eq!(h.reactor.pipeline.stats().submitted, 2);

        spin_until(&mut h, |h| {
            h.recording.complete_pending();
            h.recording.bytes().len() == 12
        });
        assert_eq!(h.reactor.pipeline.stats().submitted, 3);
    }

    #[test]
    fn oversized_header_closes_session() {
        let mut h = harness(CompletionMode::Inline);
        let client = connect(&mut h);
        let mut writer = FrameWriter::with_max_payload(client, usize::MAX);
        writer
            .send_header(spiwire_frame::FrameHeader::new(1, 65))
            .unwrap();

        spin_until(&mut h, |h| h.reactor.sessions.iter().all(Option::is_none));
        assert_eq!(h.pool.available(), h.pool.capacity());
        assert_eq!(h.recording.chunk_count(), 0);
    }

    #[test]
    fn second_client_is_rejected_when_slots_are_full() {
        let mut h = harness(CompletionMode::Inline);
        let _first = connect(&mut h);
        let addr = h.reactor.shared.listening().unwrap();
        let mut second = TcpStream::connect(addr).unwrap();
        second
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();

        let started = Instant::now();
        let mut buf = [0u8; 1];
        loop {
            h.reactor.cycle();
            match std::io::Read::read(&mut second, &mut buf) {
                Ok(0) => break,
                Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => break,
                _ => {}
            }
            assert!(started.elapsed() < Duration::from_secs(5), "reject not observed");
        }
        assert_eq!(h.reactor.sessions.iter().flatten().count(), 1);
    }

    #[test]
    fn management_bytes_reach_client() {
        let mut h = harness(CompletionMode::Inline);
        let mut client = connect(&mut h);
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();

        h.channel.submit(b"status: ok\n").unwrap();
        let mut received = Vec::new();
        spin_until(&mut h, |_| {
            let mut buf = [0u8; 64];
            if let Ok(n) = std::io::Read::read(&mut client, &mut buf) {
                received.extend_from_slice(&buf[..n]);
            }
            received == b"status: ok\n"
        });
    }

    #[test]
    fn management_larger_than_response_buffer_is_delivered_whole() {
        let config = test_config();
        assert_eq!(config.response_capacity, ServiceConfig::default().response_capacity);
        let mut h = harness_with(config, AlwaysReady, CompletionMode::Inline);
        let mut client = connect(&mut h);
        client
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();

        let message: Vec<u8> = (0..300u32).map(|i| b'a' + (i % 26) as u8).collect();
        h.channel.submit(&message).unwrap();
        let mut received = Vec::new();
        spin_until(&mut h, |_| {
            let mut buf = [0u8; 512];
            if let Ok(n) = std::io::Read::read(&mut client, &mut buf) {
                received.extend_from_slice(&buf[..n]);
            }
            received.len() >= message.len()
        });
        assert_eq!(received, message);
        assert_eq!(h.channel.pending(), 0);
    }

    #[test]
    fn idle_client_times_out() {
        let config = ServiceConfig {
            client_idle: Duration::from_millis(30),
            ..test_config()
        };
        let mut h = harness_with(config, AlwaysReady, CompletionMode::Inline);
        let mut client = connect(&mut h);
        client.write_all(&[0u8; 3]).unwrap();

        spin_until(&mut h, |h| h.reactor.sessions.iter().all(Option::is_none));
        assert_eq!(h.pool.available(), h.pool.capacity());
    }

    #[test]
    fn reset_flag_clears_published_counters() {
        let mut h = harness(CompletionMode::Inline);
        let client = connect(&mut h);
        FrameWriter::new(client).send(5, b"xyz").unwrap();

        spin_until(&mut h, |h| {
            h.reactor
                .shared
                .sessions()
                .first()
                .is_some_and(|s| s.frames_submitted == 1)
        });
        assert_eq!(h.reactor.shared.sessions()[0].bytes_received, 11);

        h.reactor.shared.reset_counters.store(true, Ordering::Release);
        h.reactor.housekeeping(Instant::now());
        let stats = h.reactor.shared.sessions();
        assert_eq!(stats[0].bytes_received, 0);
        assert_eq!(stats[0].frames_submitted, 1);
    }

    #[test]
    fn teardown_releases_everything() {
        let mut h = harness(CompletionMode::Inline);
        let client = connect(&mut h);
        let mut writer = FrameWriter::new(client);
        writer
            .send_header(spiwire_frame::FrameHeader::new(1, 32))
            .unwrap();
        spin_until(&mut h, |h| h.pool.available() < h.pool.capacity());

        h.reactor.teardown();
        assert!(!h.reactor.launched);
        assert_eq!(h.pool.available(), h.pool.capacity());
        assert!(h.reactor.shared.listening().is_none());
        assert!(matches!(
            h.channel.submit(b"x"),
            Err(crate::error::ServiceError::ManagementClosed)
        ));
    }
}
