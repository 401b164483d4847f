//! Buffer - pooled byte window with cheap header prepend/strip
//!
//! A `Buffer` owns one allocation and exposes a logical window into it.
//! The window can shrink from the front (`shift_right`, stripping a
//! header) or grow to the left into preallocated padding (`shift_left`,
//! prepending a header) without moving any payload bytes. Reallocation
//! happens only when the padding is exhausted.
//!
//! ```text
//!        start           end
//!          v              v
//! [ left padding | window | right capacity ]
//! ```
//!
//! Ownership contract: exactly one stage holds a buffer at any instant.
//! `Buffer` is deliberately not `Clone`; handing it to the next stage or
//! back to the pool consumes the value, so use-after-reuse is a compile
//! error rather than a runtime defect.

mod pool;

pub use pool::{BufferPool, LARGE_BUFFER_SIZE, LEFT_PADDING, SMALL_BUFFER_SIZE};

/// Owned byte window. Obtain from a [`BufferPool`], return with
/// [`BufferPool::reuse`].
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
    generation: u64,
}

impl Buffer {
    /// Standalone buffer with `capacity` total bytes, window empty and
    /// positioned after `left_pad` bytes of padding.
    pub fn with_capacity(capacity: usize, left_pad: usize) -> Self {
        let left_pad = left_pad.min(capacity);
        Buffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            start: left_pad,
            end: left_pad,
            generation: 0,
        }
    }

    /// Standalone buffer holding a copy of `bytes`, with default padding.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut b = Buffer::with_capacity(LEFT_PADDING + bytes.len(), LEFT_PADDING);
        b.extend_from_slice(bytes);
        b
    }

    /// Bytes currently in the window.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Total bytes of the underlying allocation.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes of padding available in front of the window.
    pub fn left_capacity(&self) -> usize {
        self.start
    }

    /// Bytes available behind the window.
    pub fn right_capacity(&self) -> usize {
        self.data.len() - self.end
    }

    /// Pool generation tag of this handle. Bumped every time the pool
    /// hands the buffer out, so a stale tag identifies a buffer that was
    /// observed across a `reuse`.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.end]
    }

    /// Grow the window `n` bytes to the left, into the padding. The new
    /// bytes are whatever the padding held; callers are expected to
    /// overwrite them (that is the point of prepending). Reallocates only
    /// when the padding is smaller than `n`.
    pub fn shift_left(&mut self, n: usize) {
        if self.start < n {
            self.expand_left(n - self.start);
        }
        self.start -= n;
    }

    /// Shrink the window by dropping `n` bytes from the front.
    ///
    /// # Panics
    /// Panics if `n` exceeds the window length.
    pub fn shift_right(&mut self, n: usize) {
        assert!(n <= self.len(), "shift_right({}) past window of {}", n, self.len());
        self.start += n;
    }

    /// Resize the window to exactly `n` bytes, growing to the right if
    /// needed. Newly exposed bytes are zero.
    pub fn set_len(&mut self, n: usize) {
        if self.right_capacity() + self.len() < n {
            self.expand_right(n - self.len() - self.right_capacity());
        }
        self.end = self.start + n;
    }

    /// Shorten the window to `n` bytes; no-op when already shorter.
    pub fn truncate(&mut self, n: usize) {
        if n < self.len() {
            self.end = self.start + n;
        }
    }

    /// Ensure at least `n` bytes of right capacity.
    pub fn reserve(&mut self, n: usize) {
        if self.right_capacity() < n {
            self.expand_right(n - self.right_capacity());
        }
    }

    /// Append a copy of `bytes` behind the window.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.data[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
    }

    /// Prepend a copy of `bytes` in front of the window.
    pub fn prepend(&mut self, bytes: &[u8]) {
        self.shift_left(bytes.len());
        self.data[self.start..self.start + bytes.len()].copy_from_slice(bytes);
    }

    /// Reset to an empty window positioned after `left_pad` bytes,
    /// keeping the allocation. Used by the pool on reuse.
    pub(crate) fn reset(&mut self, left_pad: usize) {
        self.start = left_pad.min(self.data.len());
        self.end = self.start;
    }

    fn expand_left(&mut self, deficit: usize) {
        // Grow the allocation and slide the window right so the new space
        // lands in front of it. Rare path; the pool padding covers the
        // headers of any sane stage stack.
        let grow = deficit.max(self.data.len() / 2).max(64);
        let mut data = vec![0u8; self.data.len() + grow].into_boxed_slice();
        data[self.start + grow..self.end + grow].copy_from_slice(&self.data[self.start..self.end]);
        self.data = data;
        self.start += grow;
        self.end += grow;
    }

    fn expand_right(&mut self, deficit: usize) {
        let grow = deficit.max(self.data.len() / 2).max(64);
        let mut data = vec![0u8; self.data.len() + grow].into_boxed_slice();
        data[..self.data.len()].copy_from_slice(&self.data);
        self.data = data;
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_starts_empty_after_padding() {
        let b = Buffer::with_capacity(1024, 128);
        assert_eq!(b.len(), 0);
        assert_eq!(b.left_capacity(), 128);
        assert_eq!(b.right_capacity(), 896);
    }

    #[test]
    fn test_prepend_strip_roundtrip() {
        let mut b = Buffer::from_slice(b"payload");
        b.prepend(b"HDR:");
        assert_eq!(b.as_slice(), b"HDR:payload");
        b.shift_right(4);
        assert_eq!(b.as_slice(), b"payload");
    }

    #[test]
    fn test_shift_left_reallocates_past_padding() {
        let mut b = Buffer::with_capacity(16, 2);
        b.extend_from_slice(b"abc");
        b.prepend(b"0123456789"); // 10 > 2 of padding
        assert_eq!(b.as_slice(), b"0123456789abc");
    }

    #[test]
    #[should_panic(expected = "shift_right")]
    fn test_shift_right_past_window_panics() {
        let mut b = Buffer::from_slice(b"ab");
        b.shift_right(3);
    }

    #[test]
    fn test_set_len_exposes_zeroes() {
        let mut b = Buffer::with_capacity(8, 0);
        b.set_len(4);
        assert_eq!(b.as_slice(), &[0, 0, 0, 0]);
        b.set_len(32); // forces growth
        assert_eq!(b.len(), 32);
    }
}
