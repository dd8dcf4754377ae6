//! The SPI consumer task.
//!
//! One thread owns the bus and a single transfer buffer. It sleeps on a
//! bounded message queue and wakes for submissions, chunk completions and
//! request completions. At most one request is in flight; a finished request
//! parks in a one-entry recycle slot until its callback is fired from the
//! task's own context.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use spiwire_frame::BoundedQueue;
use tracing::{debug, error, info, warn};

use crate::bus::{ChunkDone, SpiBus};
use crate::error::{Result, SpiError};

const TASK_NAME: &str = "spi2_slv";

/// Largest chunk moved in one bus transfer by default.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Default depth of the task's message queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 20;

/// Pipeline tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub chunk_size: usize,
    pub queue_depth: usize,
    /// How long the task sleeps without messages before housekeeping.
    pub idle_wake: Duration,
    /// Poll interval while waiting for the in-flight chunk.
    pub in_flight_poll: Duration,
    pub stack_size: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            idle_wake: Duration::from_secs(1),
            in_flight_poll: Duration::from_millis(1),
            stack_size: None,
        }
    }
}

/// Counters maintained by the pipeline task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub submitted: u64,
    pub completed: u64,
    pub chunks: u64,
    pub bytes: u64,
    pub failed: u64,
    pub recycle_corrupt: u64,
}

/// A payload queued for transfer, with its completion callback.
pub struct SpiRequest<B> {
    payload: B,
    done: Box<dyn FnOnce(B) + Send>,
}

impl<B: AsRef<[u8]>> SpiRequest<B> {
    /// `done` receives the payload back once the transfer finished or was
    /// abandoned. It runs on the pipeline thread.
    pub fn new<F>(payload: B, done: F) -> Self
    where
        F: FnOnce(B) + Send + 'static,
    {
        Self {
            payload,
            done: Box::new(done),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload(&self) -> &B {
        &self.payload
    }

    /// Drop the callback and take the payload back.
    pub fn into_payload(self) -> B {
        self.payload
    }

    fn finish(self) {
        (self.done)(self.payload)
    }
}

impl<B> std::fmt::Debug for SpiRequest<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpiRequest").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Message {
    Submit,
    ChunkDone,
    RequestDone,
    Quit,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    chunks: AtomicU64,
    bytes: AtomicU64,
    failed: AtomicU64,
    recycle_corrupt: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            recycle_corrupt: self.recycle_corrupt.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    quit: AtomicBool,
    chunk_done: Arc<AtomicBool>,
    counters: Counters,
}

/// Handle to a running pipeline task.
pub struct SpiPipeline<B: AsRef<[u8]> + Send + 'static> {
    queue: Arc<BoundedQueue<SpiRequest<B>>>,
    tx: SyncSender<Message>,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<B: AsRef<[u8]> + Send + 'static> SpiPipeline<B> {
    /// Allocate the transfer buffer and spawn the task.
    pub fn start<S: SpiBus>(config: PipelineConfig, bus: S) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(SpiError::InvalidConfig("chunk size must be non-zero".into()));
        }
        if config.queue_depth == 0 {
            return Err(SpiError::InvalidConfig("queue depth must be non-zero".into()));
        }

        let mut xfer = Vec::new();
        xfer.try_reserve_exact(config.chunk_size)
            .map_err(|_| SpiError::AllocFailed {
                bytes: config.chunk_size,
            })?;
        xfer.resize(config.chunk_size, 0u8);

        let queue = Arc::new(BoundedQueue::new());
        let (tx, rx) = mpsc::sync_channel(config.queue_depth);
        let shared = Arc::new(Shared::default());

        let task = Task {
            bus,
            queue: Arc::clone(&queue),
            rx,
            tx: tx.clone(),
            shared: Arc::clone(&shared),
            xfer,
            in_flight: None,
            recycle: None,
            config: config.clone(),
        };

        let mut builder = thread::Builder::new().name(TASK_NAME.into());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let handle = builder.spawn(move || task.run()).map_err(SpiError::Spawn)?;

        info!(
            chunk_size = config.chunk_size,
            queue_depth = config.queue_depth,
            "SPI pipeline started"
        );
        Ok(Self {
            queue,
            tx,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a request for transfer.
    ///
    /// Hands the request back if the pipeline is shutting down.
    pub fn submit(&self, request: SpiRequest<B>) -> std::result::Result<(), SpiRequest<B>> {
        if self.shared.quit.load(Ordering::Acquire) {
            return Err(request);
        }
        let len = request.len();
        self.queue.push(request);
        Counters::bump(&self.shared.counters.submitted, 1);

        match self.tx.try_send(Message::Submit) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(len, "SPI message queue full, request stays queued");
            }
            Err(TrySendError::Disconnected(_)) => {
                error!(len, "SPI task gone, request stays queued");
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.counters.snapshot()
    }

    /// Requests waiting to be picked up by the task.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Stop the task and wait for it. Every queued request still gets its
    /// callback.
    pub fn shutdown(&self) -> Result<()> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };
        self.shared.quit.store(true, Ordering::Release);
        let _ = self.tx.try_send(Message::Quit);
        handle.join().map_err(|_| SpiError::ShutDown)?;
        debug!("SPI pipeline stopped");
        Ok(())
    }
}

impl<B: AsRef<[u8]> + Send + 'static> Drop for SpiPipeline<B> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(error = %err, "SPI pipeline shutdown failed");
        }
    }
}

impl<B: AsRef<[u8]> + Send + 'static> std::fmt::Debug for SpiPipeline<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpiPipeline")
            .field("queued", &self.queue.len())
            .field("stats", &self.stats())
            .finish()
    }
}

struct InFlight<B> {
    request: SpiRequest<B>,
    offset: usize,
}

struct Task<B, S> {
    bus: S,
    queue: Arc<BoundedQueue<SpiRequest<B>>>,
    rx: Receiver<Message>,
    tx: SyncSender<Message>,
    shared: Arc<Shared>,
    xfer: Vec<u8>,
    in_flight: Option<InFlight<B>>,
    recycle: Option<SpiRequest<B>>,
    config: PipelineConfig,
}

impl<B: AsRef<[u8]> + Send + 'static, S: SpiBus> Task<B, S> {
    fn run(mut self) {
        debug!("SPI task running");
        while !self.quitting() {
            match self.rx.recv_timeout(self.config.idle_wake) {
                Ok(Message::Submit) => self.drain_queue(),
                Ok(Message::ChunkDone) => self.service_chunk_done(),
                Ok(Message::RequestDone) => self.drain_recycle(),
                Ok(Message::Quit) => break,
                Err(RecvTimeoutError::Timeout) => self.housekeeping(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.finish();
    }

    fn quitting(&self) -> bool {
        self.shared.quit.load(Ordering::Acquire)
    }

    /// Idle pass: catch up on notifications that could not be posted.
    fn housekeeping(&mut self) {
        let corrupt = self.shared.counters.recycle_corrupt.load(Ordering::Relaxed);
        if corrupt > 0 {
            warn!(recycle_corrupt = corrupt, "SPI recycle slot was overwritten");
        }
        self.service_chunk_done();
        self.drain_recycle();
        self.drain_queue();
    }

    fn drain_queue(&mut self) {
        while let Some(request) = self.queue.pop() {
            self.process(request);
        }
    }

    fn process(&mut self, request: SpiRequest<B>) {
        if request.is_empty() {
            debug!("zero-length SPI request completed");
            self.complete(request);
            return;
        }
        if self.quitting() {
            self.fail(request);
            return;
        }
        if !self.wait_idle() {
            warn!(len = request.len(), "in-flight transfer never completed, request dropped");
            self.fail(request);
            return;
        }
        self.drain_recycle();
        self.start_chunk(InFlight { request, offset: 0 });
    }

    /// Wait for the in-flight slot to clear. Returns false when shutdown
    /// gave up on a transfer that never completed.
    fn wait_idle(&mut self) -> bool {
        let mut abandon_at: Option<Instant> = None;
        while self.in_flight.is_some() {
            match self.rx.recv_timeout(self.config.in_flight_poll) {
                Ok(Message::RequestDone) => self.drain_recycle(),
                Ok(Message::Quit) | Err(RecvTimeoutError::Disconnected) => {
                    self.shared.quit.store(true, Ordering::Release);
                }
                Ok(Message::Submit) | Ok(Message::ChunkDone) | Err(RecvTimeoutError::Timeout) => {}
            }
            self.service_chunk_done();

            if self.quitting() && self.in_flight.is_some() {
                let deadline =
                    *abandon_at.get_or_insert_with(|| Instant::now() + self.config.idle_wake);
                if Instant::now() >= deadline {
                    if let Some(stuck) = self.in_flight.take() {
                        error!(offset = stuck.offset, "abandoning in-flight SPI transfer");
                        self.fail(stuck.request);
                    }
                    return false;
                }
            }
        }
        true
    }

    fn start_chunk(&mut self, mut in_flight: InFlight<B>) {
        let payload = in_flight.request.payload().as_ref();
        let n = self.xfer.len().min(payload.len() - in_flight.offset);
        self.xfer[..n].copy_from_slice(&payload[in_flight.offset..in_flight.offset + n]);

        self.shared.chunk_done.store(false, Ordering::Release);
        let done = ChunkDone::new(Arc::clone(&self.shared.chunk_done), self.tx.clone());
        match self.bus.start(&self.xfer[..n], done) {
            Ok(()) => {
                in_flight.offset += n;
                Counters::bump(&self.shared.counters.chunks, 1);
                Counters::bump(&self.shared.counters.bytes, n as u64);
                self.in_flight = Some(in_flight);
            }
            Err(err) => {
                warn!(error = %err, offset = in_flight.offset, "SPI transfer failed to start");
                self.fail(in_flight.request);
            }
        }
    }

    fn service_chunk_done(&mut self) {
        if !self.shared.chunk_done.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };

        if in_flight.offset < in_flight.request.len() {
            self.start_chunk(in_flight);
            return;
        }

        if let Some(older) = self.recycle.take() {
            Counters::bump(&self.shared.counters.recycle_corrupt, 1);
            error!("SPI recycle slot still occupied, completing older request first");
            self.complete(older);
        }
        self.recycle = Some(in_flight.request);
        if let Err(TrySendError::Full(_)) = self.tx.try_send(Message::RequestDone) {
            debug!("request-done notification deferred to next pass");
        }
    }

    fn drain_recycle(&mut self) {
        if let Some(request) = self.recycle.take() {
            self.complete(request);
        }
    }

    fn complete(&self, request: SpiRequest<B>) {
        Counters::bump(&self.shared.counters.completed, 1);
        request.finish();
    }

    fn fail(&self, request: SpiRequest<B>) {
        Counters::bump(&self.shared.counters.failed, 1);
        request.finish();
    }

    fn finish(&mut self) {
        self.shared.quit.store(true, Ordering::Release);
        self.wait_idle();
        self.drain_recycle();

        let mut dropped = 0usize;
        while let Some(request) = self.queue.pop() {
            self.fail(request);
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "SPI requests released without transfer at shutdown");
        }
        debug!("SPI task exiting");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::bus::{CompletionMode, NullBus, RecordingBus};

    fn config() -> PipelineConfig {
        PipelineConfig {
            chunk_size: 4,
            idle_wake: Duration::from_millis(50),
            ..PipelineConfig::default()
        }
    }

    fn request(
        payload: &[u8],
        done: &mpsc::Sender<Vec<u8>>,
    ) -> SpiRequest<Vec<u8>> {
        let done = done.clone();
        SpiRequest::new(payload.to_vec(), move |payload| {
            let _ = done.send(payload);
        })
    }

    fn recv(rx: &mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        rx.recv_timeout(Duration::from_secs(5))
            .expect("completion callback should fire")
    }

    #[test]
    fn chunks_payload_in_order() {
        let bus = RecordingBus::new(CompletionMode::Inline);
        let recording = bus.recording();
        let pipeline = SpiPipeline::start(config(), bus).unwrap();
        let (tx, rx) = mpsc::channel();

        pipeline.submit(request(b"0123456789", &tx)).unwrap();
        assert_eq!(recv(&rx), b"0123456789");

        assert_eq!(
            recording.chunks(),
            vec![b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]
        );
        pipeline.shutdown().unwrap();
        let stats = pipeline.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.bytes, 10);
    }

    #[test]
    fn requests_complete_in_submission_order() {
        let bus = RecordingBus::new(CompletionMode::Deferred(Duration::from_millis(2)));
        let recording = bus.recording();
        let pipeline = SpiPipeline::start(config(), bus).unwrap();
        let (tx, rx) = mpsc::channel();

        for payload in [&b"first"[..], b"second", b"third!"] {
            pipeline.submit(request(payload, &tx)).unwrap();
        }
        assert_eq!(recv(&rx), b"first");
        assert_eq!(recv(&rx), b"second");
        assert_eq!(recv(&rx), b"third!");
        assert_eq!(recording.bytes(), b"firstsecondthird!");

        pipeline.shutdown().unwrap();
        assert_eq!(pipeline.stats().completed, 3);
    }

    #[test]
    fn zero_length_completes_without_bus() {
        let bus = RecordingBus::new(CompletionMode::Inline);
        let recording = bus.recording();
        let pipeline = SpiPipeline::start(config(), bus).unwrap();
        let (tx, rx) = mpsc::channel();

        pipeline.submit(request(b"", &tx)).unwrap();
        assert!(recv(&rx).is_empty());
        assert_eq!(recording.chunk_count(), 0);
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn bus_failure_still_fires_callback() {
        let bus = RecordingBus::new(CompletionMode::Inline);
        let recording = bus.recording();
        recording.fail_next(1);
        let pipeline = SpiPipeline::start(config(), bus).unwrap();
        let (tx, rx) = mpsc::channel();

        pipeline.submit(request(b"doomed", &tx)).unwrap();
        assert_eq!(recv(&rx), b"doomed");
        pipeline.submit(request(b"fine", &tx)).unwrap();
        assert_eq!(recv(&rx), b"fine");

        pipeline.shutdown().unwrap();
        let stats = pipeline.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn manual_completion_gates_progress() {
        let bus = RecordingBus::new(CompletionMode::Manual);
        let recording = bus.recording();
        let pipeline = SpiPipeline::start(config(), bus).unwrap();
        let (tx, rx) = mpsc::channel();

        pipeline.submit(request(b"abcdef", &tx)).unwrap();
        let started = Instant::now();
        while recording.pending() == 0 && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(recording.chunk_count(), 1);
        assert!(rx.try_recv().is_err());

        let started = Instant::now();
        while rx.try_recv().is_err() {
            recording.complete_pending();
            assert!(started.elapsed() < Duration::from_secs(5), "request never finished");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(recording.bytes(), b"abcdef");
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn shutdown_releases_queued_requests() {
        let bus = RecordingBus::new(CompletionMode::Manual);
        let pipeline = SpiPipeline::start(config(), bus).unwrap();
        let released = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3u8 {
            let released = Arc::clone(&released);
            let req = SpiRequest::new(vec![i; 8], move |payload: Vec<u8>| {
                released.lock().unwrap().push(payload[0]);
            });
            pipeline.submit(req).unwrap();
        }
        pipeline.shutdown().unwrap();

        let mut released = released.lock().unwrap().clone();
        released.sort_unstable();
        assert_eq!(released, vec![0, 1, 2]);
        assert_eq!(pipeline.stats().failed, 3);
    }

    #[test]
    fn submit_after_shutdown_hands_request_back() {
        let pipeline = SpiPipeline::start(config(), NullBus).unwrap();
        pipeline.shutdown().unwrap();

        let (tx, _rx) = mpsc::channel();
        let rejected = pipeline.submit(request(b"late", &tx)).unwrap_err();
        assert_eq!(rejected.into_payload(), b"late");
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let cfg = PipelineConfig {
            chunk_size: 0,
            ..PipelineConfig::default()
        };
        let err = SpiPipeline::<Vec<u8>>::start(cfg, NullBus).unwrap_err();
        assert!(matches!(err, SpiError::InvalidConfig(_)));
    }

    #[test]
    fn task_thread_is_named() {
        let (tx, rx) = mpsc::channel();
        let pipeline = SpiPipeline::start(config(), NullBus).unwrap();
        let req = SpiRequest::new(vec![1u8], move |_: Vec<u8>| {
            let _ = tx.send(thread::current().name().map(str::to_owned));
        });
        pipeline.submit(req).unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some(TASK_NAME));
        pipeline.shutdown().unwrap();
    }
}
