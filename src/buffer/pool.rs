//! BufferPool - per-worker allocator of reusable buffers
//!
//! Two size classes: small buffers for handshakes and control traffic,
//! large buffers for full-size payload reads. The classes are a
//! performance knob, not a correctness requirement; `reuse` files a
//! buffer by its capacity and quietly frees anything that grew past its
//! class.
//!
//! The pool is strictly per-worker and is not `Sync`. A buffer that must
//! cross workers travels through a pipe, which transfers ownership
//! through the worker mailbox; it is then reused into the receiving
//! worker's pool. The crossing moves the `outstanding` accounting along
//! with the buffer, so each worker's counter reflects exactly the
//! buffers its own stages still hold.

use tracing::trace;

use super::Buffer;

/// Small class: control traffic, handshakes.
pub const SMALL_BUFFER_SIZE: usize = 4 * 1024;
/// Large class: full-MTU/jumbo payload reads.
pub const LARGE_BUFFER_SIZE: usize = 32 * 1024;
/// Padding reserved in front of every pooled buffer so stages can
/// prepend headers without reallocating.
pub const LEFT_PADDING: usize = 256;

/// Pooled buffers kept per class before excess is released.
const POOL_CAP: usize = 64;

/// Per-worker buffer allocator with explicit get/reuse lifecycle.
pub struct BufferPool {
    small: Vec<Buffer>,
    large: Vec<Buffer>,
    cap: usize,
    free_threshold: usize,
    outstanding: usize,
    generation: u64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_cap(POOL_CAP)
    }

    /// Pool with a custom per-class cap; half of each class is charged
    /// up front.
    pub fn with_cap(cap: usize) -> Self {
        let mut pool = BufferPool {
            small: Vec::with_capacity(cap),
            large: Vec::with_capacity(cap),
            cap,
            free_threshold: cap * 2 / 3,
            outstanding: 0,
            generation: 0,
        };
        for _ in 0..cap / 2 {
            pool.small.push(Buffer::with_capacity(SMALL_BUFFER_SIZE, LEFT_PADDING));
            pool.large.push(Buffer::with_capacity(LARGE_BUFFER_SIZE, LEFT_PADDING));
        }
        pool
    }

    /// Get a small-class buffer.
    pub fn get_small(&mut self) -> Buffer {
        if self.small.is_empty() {
            self.recharge_small();
        }
        let buffer = self.small.pop().expect("recharged");
        self.hand_out(buffer)
    }

    /// Get a large-class buffer.
    pub fn get_large(&mut self) -> Buffer {
        if self.large.is_empty() {
            self.recharge_large();
        }
        let buffer = self.large.pop().expect("recharged");
        self.hand_out(buffer)
    }

    /// Return a buffer for future reuse. Consumes the handle; the caller
    /// keeps nothing.
    pub fn reuse(&mut self, mut buffer: Buffer) {
        self.outstanding = self.outstanding.saturating_sub(1);
        buffer.reset(LEFT_PADDING);
        let shelf = match buffer.capacity() {
            SMALL_BUFFER_SIZE => &mut self.small,
            LARGE_BUFFER_SIZE => &mut self.large,
            // grew past its class (expand/merge); let the allocation go
            _ => return,
        };
        if shelf.len() >= self.cap {
            return;
        }
        shelf.push(buffer);
        if shelf.len() > self.free_threshold {
            let drop_n = shelf.len().min(self.cap / 2);
            trace!(drop_n, "pool releasing excess buffers");
            shelf.truncate(shelf.len() - drop_n);
        }
    }

    /// Concatenate `a` and `b`, copying into whichever side already has
    /// the room, and reuse the other. Returns the merged buffer.
    pub fn append_merge(&mut self, mut a: Buffer, mut b: Buffer) -> Buffer {
        if a.len() >= b.len() {
            a.extend_from_slice(b.as_slice());
            self.reuse(b);
            a
        } else {
            b.prepend(a.as_slice());
            self.reuse(a);
            b
        }
    }

    /// Buffers currently handed out and not yet reused. Zero when every
    /// stage honored the ownership contract.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Account for a buffer leaving this worker through a pipe. The
    /// receiving worker calls [`BufferPool::transfer_in`], so both
    /// `outstanding` counters stay balanced around the crossing.
    pub(crate) fn transfer_out(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Account for a buffer arriving from another worker's pool.
    pub(crate) fn transfer_in(&mut self) {
        self.outstanding += 1;
    }

    fn hand_out(&mut self, mut buffer: Buffer) -> Buffer {
        self.generation += 1;
        self.outstanding += 1;
        buffer.set_generation(self.generation);
        buffer
    }

    fn recharge_small(&mut self) {
        let batch = (self.cap / 2).max(1);
        trace!(batch, outstanding = self.outstanding, "pool recharge (small)");
        for _ in 0..batch {
            self.small.push(Buffer::with_capacity(SMALL_BUFFER_SIZE, LEFT_PADDING));
        }
    }

    fn recharge_large(&mut self) {
        let batch = (self.cap / 2).max(1);
        trace!(batch, outstanding = self.outstanding, "pool recharge (large)");
        for _ in 0..batch {
            self.large.push(Buffer::with_capacity(LARGE_BUFFER_SIZE, LEFT_PADDING));
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_reuse_accounting() {
        let mut pool = BufferPool::with_cap(8);
        let a = pool.get_small();
        let b = pool.get_large();
        assert_eq!(pool.outstanding(), 2);
        pool.reuse(a);
        pool.reuse(b);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_generation_changes_across_reuse() {
        // A buffer handed out after a reuse never carries an old tag, so
        // a stage that stashed a generation can detect use-after-reuse.
        let mut pool = BufferPool::with_cap(2);
        let a = pool.get_small();
        let gen_a = a.generation();
        pool.reuse(a);
        let b = pool.get_small();
        assert_ne!(gen_a, b.generation());
    }

    #[test]
    fn test_reuse_resets_window() {
        let mut pool = BufferPool::with_cap(2);
        let mut a = pool.get_small();
        a.extend_from_slice(b"leftover");
        pool.reuse(a);
        // drain the shelf until we get a buffer back; all must be empty
        for _ in 0..4 {
            let b = pool.get_small();
            assert!(b.is_empty());
            assert_eq!(b.left_capacity(), LEFT_PADDING);
            pool.reuse(b);
        }
    }

    #[test]
    fn test_append_merge_prefers_longer_side() {
        let mut pool = BufferPool::with_cap(2);
        let mut a = pool.get_small();
        a.extend_from_slice(b"hello ");
        let mut b = pool.get_small();
        b.extend_from_slice(b"world");
        let merged = pool.append_merge(a, b);
        assert_eq!(merged.as_slice(), b"hello world");
        pool.reuse(merged);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_oversized_buffer_not_reshelved() {
        let mut pool = BufferPool::with_cap(2);
        let mut a = pool.get_small();
        a.reserve(SMALL_BUFFER_SIZE * 2); // grows past its class
        pool.reuse(a);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_transfer_moves_accounting_between_pools() {
        // a buffer crossing workers is debited from the sender and
        // credited to the receiver, who later reuses it
        let mut sender = BufferPool::with_cap(2);
        let mut receiver = BufferPool::with_cap(2);
        let buffer = sender.get_small();
        sender.transfer_out();
        receiver.transfer_in();
        assert_eq!(sender.outstanding(), 0);
        assert_eq!(receiver.outstanding(), 1);
        receiver.reuse(buffer);
        assert_eq!(receiver.outstanding(), 0);
    }

    #[test]
    fn test_recharge_on_empty() {
        let mut pool = BufferPool::with_cap(2);
        let mut held = Vec::new();
        for _ in 0..16 {
            held.push(pool.get_large());
        }
        assert_eq!(pool.outstanding(), 16);
        for b in held {
            pool.reuse(b);
        }
        assert_eq!(pool.outstanding(), 0);
    }
}
