//! Management channel: outgoing bytes submitted by any thread and fanned
//! out to every connected client by the reactor.
//!
//! Submitters append to a shared store and kick a wake pipe; the reactor
//! polls the read end like any other socket and drains the store into each
//! session's response buffer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use spiwire_frame::FramedBuffer;
use spiwire_transport::WakeSender;
use tracing::{debug, warn};

use crate::error::{Result, ServiceError};
use crate::session::ClientSession;

struct Store {
    buf: FramedBuffer,
    wake: Option<Arc<WakeSender>>,
}

/// Shared management store.
pub struct ManagementChannel {
    store: Mutex<Store>,
    capacity: usize,
}

/// What one fan-out pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FanOut {
    /// Bytes pending in the store before the pass.
    pub pending: usize,
    /// Bytes removed from the store.
    pub drained: usize,
    /// Sessions that received data.
    pub sessions: usize,
}

impl ManagementChannel {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            store: Mutex::new(Store {
                buf: FramedBuffer::try_new(capacity)?,
                wake: None,
            }),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Install the wake pipe opened by the reactor. Stale bytes are dropped.
    pub(crate) fn attach(&self, wake: WakeSender) -> Result<()> {
        let mut store = self.lock()?;
        let stale = store.buf.remaining();
        if stale > 0 {
            debug!(stale, "discarding management bytes from previous launch");
        }
        store.buf.set_window(0, 0)?;
        store.wake = Some(Arc::new(wake));
        Ok(())
    }

    /// Forget the wake pipe; submissions fail until the next attach.
    pub(crate) fn detach(&self) {
        if let Ok(mut store) = self.lock() {
            store.wake = None;
        }
    }

    /// Kick the reactor without queuing data.
    pub(crate) fn wake(&self) {
        let wake = match self.lock() {
            Ok(store) => store.wake.clone(),
            Err(_) => None,
        };
        if let Some(wake) = wake {
            if let Err(err) = wake.kick() {
                debug!(error = %err, "management wake failed");
            }
        }
    }

    /// Queue `data` for every connected client. All or nothing.
    pub fn submit(&self, data: &[u8]) -> Result<usize> {
        let wake = {
            let mut store = self.lock()?;
            let Some(wake) = store.wake.clone() else {
                return Err(ServiceError::ManagementClosed);
            };
            store.buf.rewind();
            let free = store.buf.free_tail();
            if data.len() > free {
                return Err(ServiceError::ManagementFull {
                    requested: data.len(),
                    free,
                });
            }
            store.buf.write_at_limit(data);
            wake
        };

        if !data.is_empty() {
            if let Err(err) = wake.kick() {
                warn!(error = %err, "management wake failed, data stays queued");
            }
        }
        Ok(data.len())
    }

    /// Bytes waiting in the store.
    pub fn pending(&self) -> usize {
        self.lock().map(|store| store.buf.remaining()).unwrap_or(0)
    }

    /// Copy pending bytes into every session's response buffer.
    ///
    /// The store advances by the smallest amount any session accepted, so
    /// the slowest session loses nothing; with no session connected the
    /// store is emptied.
    pub(crate) fn fan_out<'a, I>(&self, sessions: I) -> Result<FanOut>
    where
        I: IntoIterator<Item = &'a mut ClientSession>,
    {
        let mut store = self.lock()?;
        let pending = store.buf.remaining();

        let mut count = 0usize;
        let mut min = usize::MAX;
        let mut max = 0usize;
        for session in sessions {
            let n = session.queue_output(store.buf.unread());
            count += 1;
            min = min.min(n);
            max = max.max(n);
        }

        let drained = if count == 0 {
            if pending > 0 {
                debug!(pending, "no client connected, management bytes discarded");
            }
            pending
        } else {
            if min != max {
                warn!(min, max, pending, "client might lose management data");
            }
            min
        };
        store.buf.advance(drained);
        store.buf.rewind();

        Ok(FanOut {
            pending,
            drained,
            sessions: count,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Store>> {
        self.store.lock().map_err(|_: PoisonError<_>| ServiceError::ManagementLock)
    }
}

impl std::fmt::Debug for ManagementChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementChannel")
            .field("capacity", &self.capacity)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Cloneable submission handle.
#[derive(Debug, Clone)]
pub struct ManagementHandle {
    channel: Arc<ManagementChannel>,
}

impl ManagementHandle {
    pub(crate) fn new(channel: Arc<ManagementChannel>) -> Self {
        Self { channel }
    }

    /// Queue `data` for every connected client.
    ///
    /// Fails without queuing anything when the channel is not open, the
    /// store lock is unusable, or `data` does not fit.
    pub fn submit(&self, data: &[u8]) -> Result<usize> {
        self.channel.submit(data)
    }

    pub fn pending(&self) -> usize {
        self.channel.pending()
    }

    pub fn capacity(&self) -> usize {
        self.channel.capacity()
    }
}
