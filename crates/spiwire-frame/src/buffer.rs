//! Fixed-capacity byte buffer with a read cursor and a fill limit.
//!
//! Bytes in `[pos, limit)` are the "window": unread data when the buffer is
//! used as a queue, or the region still to be filled when it is used as a
//! landing zone. The invariant `pos <= limit <= cap` holds after every
//! operation; no operation panics on short space, it just transfers less.

use crate::error::{FrameError, Result};

/// Byte buffer with `pos`/`limit` cursors over a fixed allocation.
pub struct FramedBuffer {
    data: Box<[u8]>,
    limit: usize,
    pos: usize,
}

impl FramedBuffer {
    /// Create an empty buffer (`pos == limit == 0`) of `cap` bytes.
    pub fn new(cap: usize) -> Self {
        Self {
            data: vec![0u8; cap].into_boxed_slice(),
            limit: 0,
            pos: 0,
        }
    }

    /// Like [`FramedBuffer::new`], but reports allocation failure instead of aborting.
    pub fn try_new(cap: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(cap)
            .map_err(|_| FrameError::AllocFailed { bytes: cap })?;
        data.resize(cap, 0u8);
        Ok(Self {
            data: data.into_boxed_slice(),
            limit: 0,
            pos: 0,
        })
    }

    pub fn cap(&self) -> usize {
        self.data.len()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes in the window, `limit - pos`.
    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    /// Bytes that can still be appended at `limit`.
    pub fn free_tail(&self) -> usize {
        self.data.len() - self.limit
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.pos == self.limit
    }

    /// Reset to write mode: `pos = 0`, `limit = cap`.
    pub fn clear(&mut self) {
        self.pos = 0;
        self.limit = self.data.len();
    }

    /// Switch from write mode to read mode: `limit = pos`, `pos = 0`.
    pub fn flip(&mut self) {
        self.limit = self.pos;
        self.pos = 0;
    }

    /// Compact: move `[pos, limit)` to the start of the buffer.
    pub fn rewind(&mut self) {
        if self.pos == 0 {
            return;
        }
        self.data.copy_within(self.pos..self.limit, 0);
        self.limit -= self.pos;
        self.pos = 0;
    }

    /// Copy as much of `src` as fits into `[pos, limit)`, advancing `pos`.
    ///
    /// Returns the number of bytes copied; zero means the window is full.
    pub fn write_at_pos(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.limit - self.pos);
        self.data[self.pos..self.pos + n].copy_from_slice(&src[..n]);
        self.pos += n;
        n
    }

    /// Append as much of `src` as fits into `[limit, cap)`, advancing `limit`.
    ///
    /// Returns the number of bytes appended; zero means the buffer is full.
    pub fn write_at_limit(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.data.len() - self.limit);
        self.data[self.limit..self.limit + n].copy_from_slice(&src[..n]);
        self.limit += n;
        n
    }

    /// The window `[pos, limit)`.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.pos..self.limit]
    }

    /// The window `[pos, limit)`, writable in place.
    pub fn spare_at_pos_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.pos..self.limit]
    }

    /// Everything before `limit`.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.limit]
    }

    /// Move `pos` forward by up to `n` bytes, never past `limit`.
    ///
    /// Returns how far `pos` actually moved.
    pub fn advance(&mut self, n: usize) -> usize {
        let n = n.min(self.limit - self.pos);
        self.pos += n;
        n
    }

    /// Set both cursors explicitly.
    pub fn set_window(&mut self, pos: usize, limit: usize) -> Result<()> {
        if pos > limit || limit > self.data.len() {
            return Err(FrameError::InvalidWindow {
                pos,
                limit,
                cap: self.data.len(),
            });
        }
        self.pos = pos;
        self.limit = limit;
        Ok(())
    }
}

impl std::fmt::Debug for FramedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedBuffer")
            .field("cap", &self.data.len())
            .field("pos", &self.pos)
            .field("limit", &self.limit)
            .finish()
    }
}
