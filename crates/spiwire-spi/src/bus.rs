//! The bus seam and the stock bus implementations.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use spiwire_frame::Reschedule;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pipeline::Message;

/// A serialized peripheral bus that moves one chunk at a time.
pub trait SpiBus: Send + 'static {
    /// Begin transferring `chunk`.
    ///
    /// On `Ok`, the bus must eventually call [`ChunkDone::complete`] exactly
    /// once, from any thread, possibly before `start` returns. On `Err` the
    /// notifier is dropped unused.
    fn start(&mut self, chunk: &[u8], done: ChunkDone) -> Result<()>;
}

/// One-shot completion notifier for an in-flight chunk.
///
/// Completing never blocks, so it is safe from contexts that must not wait.
#[derive(Debug)]
pub struct ChunkDone {
    flag: Arc<AtomicBool>,
    tx: SyncSender<Message>,
}

impl ChunkDone {
    pub(crate) fn new(flag: Arc<AtomicBool>, tx: SyncSender<Message>) -> Self {
        Self { flag, tx }
    }

    /// Report the chunk finished. Sets `hint` when the pipeline task was
    /// signalled and should run.
    pub fn complete(self, hint: &mut Reschedule) {
        self.flag.store(true, Ordering::Release);
        match self.tx.try_send(Message::ChunkDone) {
            Ok(()) => hint.request(),
            // The task polls the flag when its queue is full or idle.
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Bus that discards every chunk and completes inline.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBus;

impl SpiBus for NullBus {
    fn start(&mut self, _chunk: &[u8], done: ChunkDone) -> Result<()> {
        done.complete(&mut Reschedule::new());
        Ok(())
    }
}

/// Bus that writes each chunk to a character device or capture file.
#[derive(Debug)]
pub struct DeviceBus {
    path: PathBuf,
    file: File,
}

impl DeviceBus {
    /// Open `path` for writing. Regular files are created and appended to.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        info!(path = %path.display(), "SPI device opened");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SpiBus for DeviceBus {
    fn start(&mut self, chunk: &[u8], done: ChunkDone) -> Result<()> {
        self.file.write_all(chunk)?;
        done.complete(&mut Reschedule::new());
        Ok(())
    }
}

/// How a [`RecordingBus`] reports chunk completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Complete inside `start`.
    #[default]
    Inline,
    /// Complete from a helper thread after a delay.
    Deferred(Duration),
    /// Hold notifiers until [`Recording::complete_pending`] is called.
    Manual,
}

#[derive(Default)]
struct RecordingState {
    chunks: Vec<Vec<u8>>,
    pending: Vec<ChunkDone>,
    fail_next: usize,
}

/// Shared view of what a [`RecordingBus`] transferred.
#[derive(Clone, Default)]
pub struct Recording {
    state: Arc<Mutex<RecordingState>>,
}

impl Recording {
    /// Chunks in transfer order.
    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.lock().chunks.clone()
    }

    pub fn chunk_count(&self) -> usize {
        self.lock().chunks.len()
    }

    /// All transferred bytes, concatenated.
    pub fn bytes(&self) -> Vec<u8> {
        self.lock().chunks.concat()
    }

    /// Notifiers held in [`CompletionMode::Manual`].
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Fire every held notifier. Returns how many fired.
    pub fn complete_pending(&self) -> usize {
        let pending = std::mem::take(&mut self.lock().pending);
        let count = pending.len();
        let mut hint = Reschedule::new();
        for done in pending {
            done.complete(&mut hint);
        }
        count
    }

    /// Make the next `count` transfers fail to start.
    pub fn fail_next(&self, count: usize) {
        self.lock().fail_next = count;
    }

    fn lock(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Recording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Recording")
            .field("chunks", &state.chunks.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// In-memory bus that records every chunk.
#[derive(Debug, Default)]
pub struct RecordingBus {
    mode: CompletionMode,
    recording: Recording,
}

impl RecordingBus {
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            mode,
            recording: Recording::default(),
        }
    }

    /// Handle for inspecting transfers after the bus moved into a pipeline.
    pub fn recording(&self) -> Recording {
        self.recording.clone()
    }
}

impl SpiBus for RecordingBus {
    fn start(&mut self, chunk: &[u8], done: ChunkDone) -> Result<()> {
        {
            let mut state = self.recording.lock();
            if state.fail_next > 0 {
                state.fail_next -= 1;
                warn!(len = chunk.len(), "injected bus failure");
                return Err(std::io::Error::other("injected bus failure").into());
            }
            state.chunks.push(chunk.to_vec());
        }

        match self.mode {
            CompletionMode::Inline => done.complete(&mut Reschedule::new()),
            CompletionMode::Deferred(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    done.complete(&mut Reschedule::new());
                });
            }
            CompletionMode::Manual => {
                debug!(len = chunk.len(), "chunk held for manual completion");
                self.recording.lock().pending.push(done);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn notifier() -> (ChunkDone, Arc<AtomicBool>, mpsc::Receiver<Message>) {
        let flag = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::sync_channel(1);
        (ChunkDone::new(Arc::clone(&flag), tx), flag, rx)
    }

    #[test]
    fn complete_sets_flag_and_posts() {
        let (done, flag, rx) = notifier();
        let mut hint = Reschedule::new();
        done.complete(&mut hint);

        assert!(flag.load(Ordering::Acquire));
        assert!(hint.is_requested());
        assert!(matches!(rx.try_recv(), Ok(Message::ChunkDone)));
    }

    #[test]
    fn complete_on_full_queue_still_sets_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let (tx, _rx) = mpsc::sync_channel(1);
        tx.send(Message::Submit).unwrap();

        let mut hint = Reschedule::new();
        ChunkDone::new(Arc::clone(&flag), tx).complete(&mut hint);
        assert!(flag.load(Ordering::Acquire));
        assert!(!hint.is_requested());
    }

    #[test]
    fn recording_bus_inline() {
        let mut bus = RecordingBus::new(CompletionMode::Inline);
        let recording = bus.recording();
        let (done, flag, _rx) = notifier();

        bus.start(b"abc", done).unwrap();
        assert!(flag.load(Ordering::Acquire));
        assert_eq!(recording.chunks(), vec![b"abc".to_vec()]);
    }

    #[test]
    fn recording_bus_manual_holds_completion() {
        let mut bus = RecordingBus::new(CompletionMode::Manual);
        let recording = bus.recording();
        let (done, flag, _rx) = notifier();

        bus.start(b"xy", done).unwrap();
        assert!(!flag.load(Ordering::Acquire));
        assert_eq!(recording.pending(), 1);

        assert_eq!(recording.complete_pending(), 1);
        assert!(flag.load(Ordering::Acquire));
    }

    #[test]
    fn recording_bus_injected_failure() {
        let mut bus = RecordingBus::new(CompletionMode::Inline);
        let recording = bus.recording();
        recording.fail_next(1);

        let (done, flag, _rx) = notifier();
        assert!(bus.start(b"zz", done).is_err());
        assert!(!flag.load(Ordering::Acquire));
        assert_eq!(recording.chunk_count(), 0);

        let (done, _flag, _rx) = notifier();
        bus.start(b"ok", done).unwrap();
        assert_eq!(recording.bytes(), b"ok");
    }

    #[test]
    fn device_bus_appends_chunks() {
        let path = std::env::temp_dir().join(format!(
            "spiwire-device-bus-{}-{:?}.bin",
            std::process::id(),
            thread::current().id()
        ));
        let _ = std::fs::remove_file(&path);

        let mut bus = DeviceBus::open(&path).unwrap();
        let (done, flag, _rx) = notifier();
        bus.start(b"head", done).unwrap();
        let (done, _flag, _rx) = notifier();
        bus.start(b"tail", done).unwrap();
        assert!(flag.load(Ordering::Acquire));
        drop(bus);

        assert_eq!(std::fs::read(&path).unwrap(), b"headtail");
        let _ = std::fs::remove_file(&path);
    }
}
