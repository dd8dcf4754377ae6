//! One accepted client connection.

use std::io::{ErrorKind, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use spiwire_frame::{FrameDecoder, FrameError, FramePool, FrameSink, FramedBuffer, Progress};
use spiwire_transport::{Deadline, Interest, Socket};
use tracing::{debug, info};

use crate::stats::SessionStats;

#[derive(Debug)]
struct Counters {
    accepted_at: Instant,
    window_start: Instant,
    last_log: Instant,
    bytes: u64,
    frames: u64,
    stalls: u64,
}

impl Counters {
    fn new(now: Instant) -> Self {
        Self {
            accepted_at: now,
            window_start: now,
            last_log: now,
            bytes: 0,
            frames: 0,
            stalls: 0,
        }
    }

    fn kbps(&self, now: Instant) -> f64 {
        let secs = now.saturating_duration_since(self.window_start).as_secs_f64();
        if secs <= f64::EPSILON {
            return 0.0;
        }
        self.bytes as f64 / 1024.0 / secs
    }
}

/// Client connection state: the socket, the frame decoder and the
/// outgoing response buffer.
#[derive(Debug)]
pub struct ClientSession {
    socket: Socket,
    decoder: FrameDecoder,
    resp: FramedBuffer,
    counters: Counters,
}

impl ClientSession {
    pub fn new(socket: Socket, response_capacity: usize, now: Instant) -> Self {
        Self {
            socket,
            decoder: FrameDecoder::new(),
            resp: FramedBuffer::new(response_capacity),
            counters: Counters::new(now),
        }
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.socket.peer_addr()
    }

    /// Readable event: advance the frame decoder by one step.
    pub fn on_readable<S>(
        &mut self,
        pool: &FramePool,
        sink: &mut S,
        now: Instant,
        log_interval: Duration,
    ) -> Result<Progress, FrameError>
    where
        S: FrameSink + ?Sized,
    {
        let outcome = self.decoder.on_readable(&mut self.socket, pool, sink)?;
        self.counters.bytes += outcome.consumed as u64;
        match outcome.progress {
            Progress::Stalled => self.counters.stalls += 1,
            Progress::Submitted { .. } => self.counters.frames += 1,
            Progress::Pending | Progress::Dropped { .. } => {}
        }

        if now.saturating_duration_since(self.counters.last_log) >= log_interval {
            self.counters.last_log = now;
            info!(
                peer = ?self.peer(),
                kbps = self.counters.kbps(now),
                bytes = self.counters.bytes,
                frames = self.counters.frames,
                "client throughput"
            );
        }
        Ok(outcome.progress)
    }

    /// Writable event: one non-blocking write of the pending response bytes.
    pub fn on_writable(&mut self) -> Result<usize, FrameError> {
        if self.resp.is_empty() {
            return Ok(0);
        }
        let written = match self.socket.write(self.resp.unread()) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => n,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => 0,
            Err(err) => return Err(FrameError::Io(err)),
        };
        self.resp.advance(written);
        self.resp.rewind();
        Ok(written)
    }

    /// Append outgoing bytes. Returns how many fit.
    pub fn queue_output(&mut self, data: &[u8]) -> usize {
        self.resp.rewind();
        self.resp.write_at_limit(data)
    }

    pub fn has_pending_output(&self) -> bool {
        !self.resp.is_empty()
    }

    pub fn pending_output(&self) -> usize {
        self.resp.remaining()
    }

    /// Register for the next poll cycle: READ always, WRITE while output is
    /// pending, with a fresh idle deadline.
    pub fn rearm(&mut self, idle: Duration, now: Instant) {
        let mut interest = Interest::READ;
        if self.has_pending_output() {
            interest |= Interest::WRITE;
        }
        self.socket.arm(interest, Deadline::after_from(now, idle));
    }

    /// Return any frame held by the decoder and close the socket.
    pub fn release(&mut self, pool: &FramePool) {
        self.decoder.release(pool);
        if self.socket.is_open() {
            debug!(peer = ?self.peer(), "client socket closed");
        }
        self.socket.close();
    }

    /// Restart the throughput accounting window.
    pub fn reset_byte_counters(&mut self, now: Instant) {
        self.counters.bytes = 0;
        self.counters.window_start = now;
        self.counters.last_log = now;
    }

    pub fn stats(&self, slot: usize, now: Instant) -> SessionStats {
        let connected = now.saturating_duration_since(self.counters.accepted_at);
        SessionStats {
            slot,
            peer: self.peer(),
            bytes_received: self.counters.bytes,
            frames_submitted: self.counters.frames,
            stalls: self.counters.stalls,
            connected_ms: u64::try_from(connected.as_millis()).unwrap_or(u64::MAX),
            kbps: self.counters.kbps(now),
            pending_output: self.pending_output(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::{Ipv4Addr, TcpStream};
    use std::thread;

    use spiwire_frame::{FrameWriter, PooledFrame};

    use super::*;

    fn connected_pair() -> (ClientSession, TcpStream) {
        let listener = Socket::listen((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();

        let started = Instant::now();
        loop {
            if let Some(sock) = listener.accept().unwrap() {
                return (ClientSession::new(sock, 16, Instant::now()), client);
            }
            assert!(started.elapsed() < Duration::from_secs(5), "accept timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn read_until<F>(session: &mut ClientSession, pool: &FramePool, mut done: F) -> Vec<PooledFrame>
    where
        F: FnMut(&[PooledFrame]) -> bool,
    {
        let mut frames = Vec::new();
        let started = Instant::now();
        while !done(&frames) {
            let mut sink = |frame: PooledFrame| -> Result<(), PooledFrame> {
                frames.push(frame);
                Ok(())
            };
            session
                .on_readable(pool, &mut sink, Instant::now(), Duration::from_secs(60))
                .unwrap();
            assert!(started.elapsed() < Duration::from_secs(5), "read timed out");
            thread::sleep(Duration::from_millis(1));
        }
        frames
    }

    #[test]
    fn decodes_frames_split_across_writes() {
        let (mut session, client) = connected_pair();
        let pool = FramePool::with_capacity(2, 32).unwrap();
        let mut writer = FrameWriter::new(client);

        writer
            .send_header(spiwire_frame::FrameHeader::new(1, 10))
            .unwrap();
        writer.send_raw(b"012").unwrap();
        thread::sleep(Duration::from_millis(10));
        writer.send_raw(b"3456789").unwrap();

        let frames = read_until(&mut session, &pool, |frames| !frames.is_empty());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].tag(), 1);
        assert_eq!(frames[0].payload(), b"0123456789");

        let stats = session.stats(0, Instant::now());
        assert_eq!(stats.bytes_received, 18);
        assert_eq!(stats.frames_submitted, 1);
    }

    #[test]
    fn queued_output_reaches_peer() {
        let (mut session, mut client) = connected_pair();
        assert_eq!(session.queue_output(b"status"), 6);
        assert!(session.has_pending_output());

        session.rearm(Duration::from_secs(10), Instant::now());
        assert_eq!(session.socket().interest(), Interest::READ | Interest::WRITE);

        assert_eq!(session.on_writable().unwrap(), 6);
        assert!(!session.has_pending_output());
        session.rearm(Duration::from_secs(10), Instant::now());
        assert_eq!(session.socket().interest(), Interest::READ);

        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"status");
    }

    #[test]
    fn output_is_bounded_by_response_capacity() {
        let (mut session, _client) = connected_pair();
        assert_eq!(session.queue_output(&[7u8; 40]), 16);
        assert_eq!(session.queue_output(b"more"), 0);
        assert_eq!(session.pending_output(), 16);
    }

    #[test]
    fn peer_close_is_connection_closed() {
        let (mut session, client) = connected_pair();
        let pool = FramePool::with_capacity(1, 32).unwrap();
        drop(client);

        let started = Instant::now();
        let err = loop {
            let mut sink = |frame: PooledFrame| -> Result<(), PooledFrame> { Err(frame) };
            match session.on_readable(&pool, &mut sink, Instant::now(), Duration::from_secs(60)) {
                Ok(_) => {
                    assert!(started.elapsed() < Duration::from_secs(5), "close not observed");
                    thread::sleep(Duration::from_millis(1));
                }
                Err(err) => break err,
            }
        };
        assert!(matches!(err, FrameError::ConnectionClosed));

        session.release(&pool);
        assert!(!session.socket().is_open());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn reset_restarts_byte_window() {
        let (mut session, client) = connected_pair();
        let pool = FramePool::with_capacity(1, 32).unwrap();
        FrameWriter::new(client).send(2, b"abcd").unwrap();

        let frames = read_until(&mut session, &pool, |frames| !frames.is_empty());
        assert_eq!(frames.len(), 1);
        assert_eq!(session.stats(0, Instant::now()).bytes_received, 12);

        session.reset_byte_counters(Instant::now());
        let stats = session.stats(0, Instant::now());
        assert_eq!(stats.bytes_received, 0);
        assert_eq!(stats.frames_submitted, 1);
    }
}
