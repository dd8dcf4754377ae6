use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::interest::{Deadline, Interest};

const WAKE_DRAIN_CHUNK: usize = 64;

/// A socket registered with the reactor.
///
/// A `Socket` starts closed and is opened by [`Socket::listen`],
/// [`Socket::accept`] or [`Socket::wake_pair`]. Every open handle is
/// non-blocking. The reactor resets `interest` and `deadline` before each
/// handler call, so a handler that wants to keep being polled must
/// [`arm`](Socket::arm) it again.
pub struct Socket {
    handle: Option<Handle>,
    interest: Interest,
    deadline: Deadline,
    peer: Option<SocketAddr>,
}

enum Handle {
    Listener(TcpListener),
    Stream(TcpStream),
    Wake(UnixStream),
}

impl Socket {
    /// A closed, unmonitored socket.
    pub const fn closed() -> Self {
        Self {
            handle: None,
            interest: Interest::empty(),
            deadline: Deadline::Never,
            peer: None,
        }
    }

    /// Bind a non-blocking TCP listener on `addr`.
    pub fn listen(addr: SocketAddr) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| TransportError::Bind { addr, source })?;

        let local = listener.local_addr().unwrap_or(addr);
        info!(addr = %local, "listening");

        Ok(Self {
            handle: Some(Handle::Listener(listener)),
            ..Self::closed()
        })
    }

    /// Accept one pending connection.
    ///
    /// Returns `Ok(None)` when no connection is pending. The accepted stream is
    /// non-blocking and unarmed.
    pub fn accept(&self) -> Result<Option<Socket>> {
        let Some(Handle::Listener(listener)) = &self.handle else {
            return Err(TransportError::Closed);
        };

        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return Ok(None)
            }
            Err(err) => return Err(TransportError::Accept(err)),
        };
        stream.set_nonblocking(true)?;

        Ok(Some(Socket {
            handle: Some(Handle::Stream(stream)),
            peer: Some(peer),
            ..Self::closed()
        }))
    }

    /// Accept one pending connection and close it immediately.
    ///
    /// Used when no session slot is free, so the backlog entry is not leaked.
    pub fn reject(&self) -> Result<Option<SocketAddr>> {
        let rejected = self.accept()?;
        Ok(rejected.and_then(|sock| {
            debug!(peer = ?sock.peer, "rejected connection");
            sock.peer
        }))
    }

    /// Create a wake pipe: the returned socket becomes readable whenever the
    /// [`WakeSender`] is kicked.
    pub fn wake_pair() -> Result<(Socket, WakeSender)> {
        let (rx, tx) = UnixStream::pair()?;
        rx.set_nonblocking(true)?;
        tx.set_nonblocking(true)?;
        Ok((
            Socket {
                handle: Some(Handle::Wake(rx)),
                ..Self::closed()
            },
            WakeSender { stream: tx },
        ))
    }

    /// Read and discard every pending wake byte. Returns the number drained.
    pub fn drain_wake(&mut self) -> io::Result<usize> {
        let mut drained = 0usize;
        let mut chunk = [0u8; WAKE_DRAIN_CHUNK];
        loop {
            match self.read(&mut chunk) {
                Ok(0) => return Ok(drained),
                Ok(n) => drained += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(drained),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Register interest and a deadline for the next poll cycle.
    pub fn arm(&mut self, interest: Interest, deadline: Deadline) {
        self.interest = interest;
        self.deadline = deadline;
    }

    /// Clear interest and deadline. The socket stays open but unmonitored.
    pub fn disarm(&mut self) {
        self.interest = Interest::empty();
        self.deadline = Deadline::Never;
    }

    /// Close the handle and reset to the unmonitored state.
    pub fn close(&mut self) {
        self.handle = None;
        self.peer = None;
        self.disarm();
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Raw descriptor, or `None` when closed.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.handle.as_ref().map(|handle| match handle {
            Handle::Listener(l) => l.as_raw_fd(),
            Handle::Stream(s) => s.as_raw_fd(),
            Handle::Wake(w) => w.as_raw_fd(),
        })
    }

    /// Remote address of an accepted stream.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Local address of a listener or stream.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.handle.as_ref()? {
            Handle::Listener(l) => l.local_addr().ok(),
            Handle::Stream(s) => s.local_addr().ok(),
            Handle::Wake(_) => None,
        }
    }
}

impl Default for Socket {
    fn default() -> Self {
        Self::closed()
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.handle {
            Some(Handle::Stream(stream)) => stream.read(buf),
            Some(Handle::Wake(wake)) => wake.read(buf),
            Some(Handle::Listener(_)) => Err(io::Error::new(
                ErrorKind::InvalidInput,
                "cannot read from a listening socket",
            )),
            None => Err(io::Error::from(ErrorKind::NotConnected)),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.handle {
            Some(Handle::Stream(stream)) => stream.write(buf),
            Some(Handle::Wake(wake)) => wake.write(buf),
            Some(Handle::Listener(_)) => Err(io::Error::new(
                ErrorKind::InvalidInput,
                "cannot write to a listening socket",
            )),
            None => Err(io::Error::from(ErrorKind::NotConnected)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.handle {
            Some(Handle::Stream(stream)) => stream.flush(),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.handle {
            Some(Handle::Listener(_)) => "listener",
            Some(Handle::Stream(_)) => "stream",
            Some(Handle::Wake(_)) => "wake",
            None => "closed",
        };
        f.debug_struct("Socket")
            .field("kind", &kind)
            .field("fd", &self.raw_fd())
            .field("interest", &self.interest)
            .field("deadline", &self.deadline)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Write end of a wake pipe.
#[derive(Debug)]
pub struct WakeSender {
    stream: UnixStream,
}

impl WakeSender {
    /// Make the paired socket readable.
    ///
    /// A full pipe already guarantees a pending wake, so `WouldBlock` counts
    /// as success.
    pub fn kick(&self) -> io::Result<()> {
        loop {
            match (&self.stream).write(&[1u8]) {
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}
