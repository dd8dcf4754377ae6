//! Fixed set of frame buffers recycled through a free queue.
//!
//! Frames move by value: a popped [`PooledFrame`] is owned by exactly one
//! holder until it is pushed back, so a frame can be neither in the free
//! queue twice nor in use by two holders. Each pool stamps its frames with
//! its own identity and refuses frames stamped by another pool.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::buffer::FramedBuffer;
use crate::error::{FrameError, Result};
use crate::queue::{BoundedQueue, Reschedule, TryOp};

/// A frame buffer on loan from a [`FramePool`].
#[derive(Debug)]
pub struct PooledFrame {
    pool: u64,
    slot: usize,
    tag: u32,
    buffer: FramedBuffer,
}

impl PooledFrame {
    /// Arena index of this frame, unique within its pool.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn set_tag(&mut self, tag: u32) {
        self.tag = tag;
    }

    pub fn buffer(&self) -> &FramedBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut FramedBuffer {
        &mut self.buffer
    }

    /// Filled payload bytes, `[0, limit)`.
    pub fn payload(&self) -> &[u8] {
        self.buffer.filled()
    }
}

impl AsRef<[u8]> for PooledFrame {
    fn as_ref(&self) -> &[u8] {
        self.payload()
    }
}

/// Pool of `capacity` equally sized frames.
#[derive(Debug)]
pub struct FramePool {
    id: u64,
    free: BoundedQueue<PooledFrame>,
    capacity: usize,
    frame_size: usize,
}

impl FramePool {
    /// Allocate `count` frames of `frame_size` bytes each.
    pub fn with_capacity(count: usize, frame_size: usize) -> Result<Self> {
        if count == 0 {
            return Err(FrameError::InvalidPool("frame count must be non-zero".into()));
        }
        if frame_size == 0 {
            return Err(FrameError::InvalidPool("frame size must be non-zero".into()));
        }

        static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);

        let free = BoundedQueue::with_capacity(count);
        for slot in 0..count {
            let buffer = FramedBuffer::try_new(frame_size).map_err(|_| {
                FrameError::AllocFailed {
                    bytes: count.saturating_mul(frame_size),
                }
            })?;
            free.push(PooledFrame {
                pool: id,
                slot,
                tag: 0,
                buffer,
            });
        }

        debug!(count, frame_size, "frame pool allocated");
        Ok(Self {
            id,
            free,
            capacity: count,
            frame_size,
        })
    }

    /// Take a frame, reset to write mode. `None` when the pool is exhausted.
    pub fn pop(&self) -> Option<PooledFrame> {
        self.free.pop().map(reset)
    }

    /// Return a frame to the pool. A frame popped from another pool is
    /// dropped.
    pub fn push(&self, frame: PooledFrame) {
        if self.refuse_foreign(&frame) {
            return;
        }
        self.free.push(frame);
    }

    /// Non-blocking [`FramePool::pop`].
    pub fn try_pop(&self, hint: &mut Reschedule) -> TryOp<Option<PooledFrame>> {
        match self.free.try_pop(hint) {
            TryOp::Ready(frame) => TryOp::Ready(frame.map(reset)),
            TryOp::Contended => TryOp::Contended,
        }
    }

    /// Non-blocking [`FramePool::push`]. Hands the frame back when contended.
    pub fn try_push(
        &self,
        frame: PooledFrame,
        hint: &mut Reschedule,
    ) -> std::result::Result<(), PooledFrame> {
        if self.refuse_foreign(&frame) {
            return Ok(());
        }
        self.free.try_push(frame, hint)
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn try_is_empty(&self, hint: &mut Reschedule) -> TryOp<bool> {
        self.free.try_is_empty(hint)
    }

    /// Frames currently in the free queue.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total frames owned by the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Whether `frame` was allocated by this pool.
    pub fn owns(&self, frame: &PooledFrame) -> bool {
        frame.pool == self.id
    }

    fn refuse_foreign(&self, frame: &PooledFrame) -> bool {
        if self.owns(frame) {
            return false;
        }
        warn!(
            slot = frame.slot,
            cap = frame.buffer.cap(),
            "frame from another pool refused"
        );
        true
    }
}

fn reset(mut frame: PooledFrame) -> PooledFrame {
    frame.tag = 0;
    frame.buffer.clear();
    frame
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn rejects_empty_geometry() {
        assert!(matches!(
            FramePool::with_capacity(0, 16),
            Err(FrameError::InvalidPool(_))
        ));
        assert!(matches!(
            FramePool::with_capacity(2, 0),
            Err(FrameError::InvalidPool(_))
        ));
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = FramePool::with_capacity(3, 64).unwrap();
        let a = pool.pop().unwrap();
        let b = pool.pop().unwrap();
        let c = pool.pop().unwrap();
        assert!(pool.pop().is_none());
        assert!(pool.is_empty());

        pool.push(b);
        assert_eq!(pool.available(), 1);
        drop((a, c));
    }

    #[test]
    fn popped_frames_are_distinct_and_reset() {
        let pool = FramePool::with_capacity(3, 8).unwrap();
        let mut frame = pool.pop().unwrap();
        frame.set_tag(9);
        frame.buffer_mut().set_window(0, 3).unwrap();
        frame.buffer_mut().write_at_pos(b"abc");
        pool.push(frame);

        let frames: Vec<_> = std::iter::from_fn(|| pool.pop()).collect();
        let slots: HashSet<_> = frames.iter().map(PooledFrame::slot).collect();
        assert_eq!(slots.len(), 3);
        for frame in &frames {
            assert_eq!(frame.tag(), 0);
            assert_eq!(frame.buffer().pos(), 0);
            assert_eq!(frame.buffer().limit(), 8);
        }
    }

    #[test]
    fn try_variants_report_contention() {
        let pool = FramePool::with_capacity(1, 8).unwrap();
        let mut hint = Reschedule::new();
        let frame = pool.try_pop(&mut hint).ready().flatten().unwrap();
        assert_eq!(pool.try_is_empty(&mut hint), TryOp::Ready(true));
        pool.try_push(frame, &mut hint).unwrap();
        assert!(hint.is_requested());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn frames_from_another_pool_are_refused() {
        let a = FramePool::with_capacity(1, 16).unwrap();
        let b = FramePool::with_capacity(1, 16).unwrap();
        let c = FramePool::with_capacity(1, 8).unwrap();

        let frame = a.pop().unwrap();
        assert!(a.owns(&frame));
        assert!(!b.owns(&frame));
        b.push(frame);
        assert_eq!(b.available(), b.capacity());

        let frame = c.pop().unwrap();
        let mut hint = Reschedule::new();
        assert!(b.try_push(frame, &mut hint).is_ok());
        assert!(!hint.is_requested());
        assert_eq!(b.available(), 1);
        assert_eq!(c.available(), 0);
    }

    #[test]
    fn capacity_is_conserved_under_concurrent_use() {
        let pool = Arc::new(FramePool::with_capacity(3, 32).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(frame) = pool.pop() {
                            thread::yield_now();
                            pool.push(frame);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(pool.available(), pool.capacity());
        let frames: Vec<_> = std::iter::from_fn(|| pool.pop()).collect();
        let slots: HashSet<_> = frames.iter().map(PooledFrame::slot).collect();
        assert_eq!(slots.len(), 3);
    }
}
