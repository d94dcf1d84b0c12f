use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ordered `(value, size)` pairs plus a running total size.
///
/// Only ever mutated while the owning stream's state mutex is held; the total
/// is additionally mirrored into a [`SizeMirror`] so `desired_size` can be
/// answered without taking the lock.
pub(crate) struct ChunkQueue<T> {
    items: VecDeque<(T, f64)>,
    total: f64,
}

impl<T> ChunkQueue<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            total: 0.0,
        }
    }

    pub fn push(&mut self, value: T, size: f64) {
        self.items.push_back((value, size));
        self.total += size;
    }

    pub fn pop(&mut self) -> Option<(T, f64)> {
        let (value, size) = self.items.pop_front()?;
        self.total -= size;
        // Running subtraction drifts; snap back once empty.
        if self.items.is_empty() {
            self.total = 0.0;
        }
        Some((value, size))
    }

    /// Re-queue a partially consumed chunk at the front, keeping FIFO order
    /// for everything behind it. Used by byte-mode `read_into`.
    pub fn push_front(&mut self, value: T, size: f64) {
        self.items.push_front((value, size));
        self.total += size;
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.total = 0.0;
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.total
    }
}

/// Lock-free mirror of a queue's total size, stored as `f64` bits.
///
/// Written only under the owning stream's mutex, so reads are monotonic
/// between lock-protected writes.
pub(crate) struct SizeMirror(AtomicU64);

impl SizeMirror {
    pub fn new() -> Self {
        Self(AtomicU64::new(0.0f64.to_bits()))
    }

    pub fn store(&self, total: f64) {
        self.0.store(total.to_bits(), Ordering::Release);
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_and_total() {
        let mut q = ChunkQueue::new();
        q.push("a", 2.0);
        q.push("b", 3.0);
        assert_eq!(q.total(), 5.0);
        assert_eq!(q.pop(), Some(("a", 2.0)));
        assert_eq!(q.total(), 3.0);
        assert_eq!(q.pop(), Some(("b", 3.0)));
        assert!(q.is_empty());
        assert_eq!(q.total(), 0.0);
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_push_front_preserves_order() {
        let mut q = ChunkQueue::new();
        q.push(1, 1.0);
        q.push(2, 1.0);
        let (v, s) = q.pop().unwrap();
        assert_eq!(v, 1);
        q.push_front(v, s);
        assert_eq!(q.pop(), Some((1, 1.0)));
        assert_eq!(q.pop(), Some((2, 1.0)));
    }

    #[test]
    fn test_size_mirror() {
        let m = SizeMirror::new();
        assert_eq!(m.load(), 0.0);
        m.store(2.5);
        assert_eq!(m.load(), 2.5);
    }
}
