//! Lock-protected FIFO shared between the reactor, the SPI task and
//! completion contexts.
//!
//! The blocking operations wait for the lock. The `try_*` operations never
//! block: they are meant for completion paths that must not stall, and they
//! report through a [`Reschedule`] hint when a waiting consumer may now have
//! work.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

/// Hint set by non-blocking queue operations when a consumer should run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reschedule {
    requested: bool,
}

impl Reschedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&mut self) {
        self.requested = true;
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }
}

/// Outcome of a non-blocking queue operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryOp<T> {
    /// The lock was taken and the operation ran.
    Ready(T),
    /// The lock was held elsewhere; nothing happened.
    Contended,
}

impl<T> TryOp<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            TryOp::Ready(value) => Some(value),
            TryOp::Contended => None,
        }
    }
}

/// FIFO queue behind a single mutex.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> BoundedQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue with storage for `capacity` items reserved up front.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Remove the head item, waiting for the lock.
    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Append an item at the tail, waiting for the lock.
    pub fn push(&self, item: T) {
        self.lock().push_back(item);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Remove the head item without blocking.
    pub fn try_pop(&self, hint: &mut Reschedule) -> TryOp<Option<T>> {
        match self.try_lock() {
            Some(mut items) => {
                let item = items.pop_front();
                if item.is_some() && !items.is_empty() {
                    hint.request();
                }
                TryOp::Ready(item)
            }
            None => TryOp::Contended,
        }
    }

    /// Append an item without blocking. Hands the item back when contended.
    pub fn try_push(&self, item: T, hint: &mut Reschedule) -> Result<(), T> {
        match self.try_lock() {
            Some(mut items) => {
                if items.is_empty() {
                    hint.request();
                }
                items.push_back(item);
                Ok(())
            }
            None => Err(item),
        }
    }

    pub fn try_is_empty(&self, _hint: &mut Reschedule) -> TryOp<bool> {
        match self.try_lock() {
            Some(items) => TryOp::Ready(items.is_empty()),
            None => TryOp::Contended,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock(&self) -> Option<MutexGuard<'_, VecDeque<T>>> {
        match self.items.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn fifo_order() {
        let q = BoundedQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn try_variants_work_when_uncontended() {
        let q = BoundedQueue::with_capacity(2);
        let mut hint = Reschedule::new();

        assert_eq!(q.try_is_empty(&mut hint), TryOp::Ready(true));
        q.try_push("a", &mut hint).unwrap();
        assert!(hint.is_requested());

        let mut hint = Reschedule::new();
        q.try_push("b", &mut hint).unwrap();
        assert!(!hint.is_requested());

        assert_eq!(q.try_pop(&mut hint).ready(), Some(Some("a")));
        assert_eq!(q.try_pop(&mut hint).ready(), Some(Some("b")));
        assert_eq!(q.try_pop(&mut hint).ready(), Some(None));
    }

    #[test]
    fn try_variants_never_block_on_held_lock() {
        let q = BoundedQueue::new();
        q.push(5);
        let mut hint = Reschedule::new();

        let guard = q.items.lock().unwrap();
        assert_eq!(q.try_pop(&mut hint), TryOp::Contended);
        assert_eq!(q.try_is_empty(&mut hint), TryOp::Contended);
        assert_eq!(q.try_push(6, &mut hint), Err(6));
        drop(guard);

        assert!(!hint.is_requested());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn survives_poisoned_lock() {
        let q = Arc::new(BoundedQueue::new());
        q.push(1);

        let poisoner = Arc::clone(&q);
        let _ = thread::spawn(move || {
            let _guard = poisoner.items.lock().unwrap();
            panic!("poison the queue lock");
        })
        .join();

        assert_eq!(q.pop(), Some(1));
        let mut hint = Reschedule::new();
        assert!(q.try_push(2, &mut hint).is_ok());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let q = Arc::new(BoundedQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..250 {
                        q.push(t * 1000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = Vec::new();
        while let Some(v) = q.pop() {
            seen.push(v);
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 1000);
    }
}
