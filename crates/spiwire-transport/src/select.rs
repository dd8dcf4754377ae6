//! `select()`-based readiness polling.
//!
//! One poll cycle is split in three steps so the reactor can interleave its
//! own bookkeeping:
//!
//! 1. [`Selector::prepare`] zeroes the fd sets, registers every open socket's
//!    interest and folds the socket deadlines into a [`WaitBound`]
//! 2. [`Selector::wait`] blocks until a registered fd is ready or the timeout
//!    elapses
//! 3. [`Selector::observe`] intersects the result sets with one socket and
//!    synthesizes [`Ready::TIMEOUT`] when nothing fired past its deadline

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use tracing::error;

use crate::interest::{Deadline, Interest, Ready};
use crate::socket::Socket;

/// Outcome of folding socket deadlines together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitBound {
    /// Some deadline already passed; poll without blocking.
    Immediate,
    /// Wake no later than this instant.
    Until(Instant),
    /// No socket has a deadline.
    Unbounded,
}

impl WaitBound {
    /// Convert to a `select()` timeout.
    ///
    /// A pending bound is clamped to `[floor, cap]` so a nearly-due socket
    /// cannot cause a poll storm; `Immediate` stays zero and `Unbounded`
    /// becomes `cap`.
    pub fn timeout(&self, now: Instant, floor: Duration, cap: Duration) -> Duration {
        match self {
            WaitBound::Immediate => Duration::ZERO,
            WaitBound::Until(t) => t.saturating_duration_since(now).min(cap).max(floor),
            WaitBound::Unbounded => cap,
        }
    }
}

/// Why a multiplexed wait returned without results.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// A signal interrupted the wait; retry.
    #[error("wait interrupted")]
    Interrupted,
    /// The wait primitive failed; the reactor must rebuild its sockets.
    #[error("select failed: {0}")]
    Failed(io::Error),
}

/// Fold socket deadlines into one wait bound.
///
/// `Never` contributes nothing; any deadline at or before `now` forces an
/// immediate poll.
pub fn earliest_deadline<I>(deadlines: I, now: Instant) -> WaitBound
where
    I: IntoIterator<Item = Deadline>,
{
    let mut earliest = Deadline::Never;
    for deadline in deadlines {
        if deadline.is_elapsed(now) {
            return WaitBound::Immediate;
        }
        earliest = earliest.min(deadline);
    }
    match earliest {
        Deadline::At(t) => WaitBound::Until(t),
        Deadline::Never => WaitBound::Unbounded,
    }
}

/// Readiness reported to a socket's handler.
///
/// `TIMEOUT` is synthesized only when no I/O condition fired.
pub fn observed_readiness(fired: Ready, deadline: Deadline, now: Instant) -> Ready {
    let fired = fired & Ready::IO;
    if fired.is_empty() && deadline.is_elapsed(now) {
        Ready::TIMEOUT
    } else {
        fired
    }
}

/// Reusable `select()` state.
pub struct Selector {
    read: libc::fd_set,
    write: libc::fd_set,
    except: libc::fd_set,
    max_fd: RawFd,
}

impl Selector {
    pub fn new() -> Self {
        // SAFETY: fd_set is a plain bitmap; an all-zero value is valid and is
        // what FD_ZERO produces.
        let empty: libc::fd_set = unsafe { std::mem::zeroed() };
        Self {
            read: empty,
            write: empty,
            except: empty,
            max_fd: -1,
        }
    }

    /// Zero the sets and register `sockets`.
    ///
    /// Returns `None` when no socket is open, otherwise the bound derived from
    /// the open sockets' deadlines.
    pub fn prepare<'a, I>(&mut self, sockets: I, now: Instant) -> Option<WaitBound>
    where
        I: IntoIterator<Item = &'a Socket>,
    {
        // SAFETY: the sets are owned, initialized fd_set values.
        unsafe {
            libc::FD_ZERO(&mut self.read);
            libc::FD_ZERO(&mut self.write);
            libc::FD_ZERO(&mut self.except);
        }
        self.max_fd = -1;

        let mut deadlines = Vec::new();
        for sock in sockets {
            let Some(fd) = sock.raw_fd() else { continue };
            if !fd_in_range(fd) {
                error!(fd, "descriptor exceeds FD_SETSIZE, not polled");
                continue;
            }

            self.max_fd = self.max_fd.max(fd);
            let interest = sock.interest();
            // SAFETY: fd is within [0, FD_SETSIZE) and the sets are initialized.
            unsafe {
                if interest.contains(Interest::READ) {
                    libc::FD_SET(fd, &mut self.read);
                }
                if interest.contains(Interest::WRITE) {
                    libc::FD_SET(fd, &mut self.write);
                }
                if interest.contains(Interest::EXCEPT) {
                    libc::FD_SET(fd, &mut self.except);
                }
            }
            deadlines.push(sock.deadline());
        }

        if self.max_fd < 0 {
            return None;
        }
        Some(earliest_deadline(deadlines, now))
    }

    /// Block until a registered descriptor is ready or `timeout` elapses.
    ///
    /// Returns the number of ready descriptors (zero on timeout).
    pub fn wait(&mut self, timeout: Duration) -> Result<usize, WaitError> {
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        // SAFETY: all pointers refer to live, initialized values owned by self
        // or this stack frame; max_fd + 1 bounds the scanned range.
        let rc = unsafe {
            libc::select(
                self.max_fd + 1,
                &mut self.read,
                &mut self.write,
                &mut self.except,
                &mut tv,
            )
        };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Err(WaitError::Interrupted);
            }
            return Err(WaitError::Failed(err));
        }
        Ok(rc as usize)
    }

    /// Readiness of `sock` after [`wait`](Selector::wait), including a
    /// synthesized timeout.
    pub fn observe(&self, sock: &Socket, now: Instant) -> Ready {
        let mut fired = Ready::empty();
        if let Some(fd) = sock.raw_fd().filter(|fd| *fd <= self.max_fd && fd_in_range(*fd)) {
            // SAFETY: fd is within [0, FD_SETSIZE) and the sets are initialized.
            unsafe {
                if libc::FD_ISSET(fd, &self.read) {
                    fired |= Ready::READ;
                }
                if libc::FD_ISSET(fd, &self.write) {
                    fired |= Ready::WRITE;
                }
                if libc::FD_ISSET(fd, &self.except) {
                    fired |= Ready::EXCEPT;
                }
            }
        }
        observed_readiness(fired, sock.deadline(), now)
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("max_fd", &self.max_fd)
            .finish_non_exhaustive()
    }
}

fn fd_in_range(fd: RawFd) -> bool {
    fd >= 0 && (fd as usize) < libc::FD_SETSIZE as usize
}
