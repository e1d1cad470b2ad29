//! Elastic per-connection byte buffers.
//!
//! One contiguous allocation with a live window `[data_start, data_end)`.
//! Consumed bytes leave leading slack behind; appends reuse it by compacting
//! the live window down to offset zero before they pay for a reallocation.
//! Reallocation at least doubles the required size, so appends are O(1)
//! amortized per byte.
//!
//! The same type backs both directions of a connection: requests are
//! appended as they arrive from the socket and consumed as frames are
//! decoded; responses are appended by the encoder and consumed as the
//! socket accepts them.

use crate::error::BufferError;
use tracing::warn;

/// Growable byte region with separately tracked leading and trailing slack.
pub struct ElasticBuffer {
    /// Backing allocation. Its length is the buffer capacity.
    storage: Vec<u8>,
    /// Offset of the first live byte.
    data_start: usize,
    /// Offset one past the last live byte.
    data_end: usize,
}

impl ElasticBuffer {
    /// Create a buffer with `capacity` bytes of free space.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity],
            data_start: 0,
            data_end: 0,
        }
    }

    /// Number of live bytes.
    pub fn len(&self) -> usize {
        self.data_end - self.data_start
    }

    pub fn is_empty(&self) -> bool {
        self.data_start == self.data_end
    }

    /// Size of the backing allocation.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Total free space: leading plus trailing slack.
    pub fn free_space(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Slack in front of the live window, reclaimable by `compact`.
    pub fn leading_space(&self) -> usize {
        self.data_start
    }

    /// Slack after the live window, usable without moving anything.
    pub fn trailing_space(&self) -> usize {
        self.storage.len() - self.data_end
    }

    /// The live bytes, oldest first.
    pub fn data(&self) -> &[u8] {
        &self.storage[self.data_start..self.data_end]
    }

    /// Append `bytes` at the live tail.
    ///
    /// Either all of `bytes` is appended or the buffer is left untouched and
    /// `BufferError::Alloc` is returned.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let required = self
            .len()
            .checked_add(bytes.len())
            .ok_or(BufferError::Alloc { requested: usize::MAX })?;

        if required > self.capacity() {
            let doubled = required
                .checked_mul(2)
                .ok_or(BufferError::Alloc { requested: usize::MAX })?;
            let new_capacity = doubled.max(self.capacity());
            if let Err(e) = self.grow(new_capacity) {
                warn!(requested = new_capacity, live = self.len(), "Buffer growth failed");
                return Err(e);
            }
        } else if bytes.len() > self.trailing_space() {
            self.compact();
        }

        self.storage[self.data_end..self.data_end + bytes.len()].copy_from_slice(bytes);
        self.data_end += bytes.len();
        Ok(())
    }

    pub fn append_u8(&mut self, value: u8) -> Result<(), BufferError> {
        self.append(&[value])
    }

    /// Append a `u32` in host byte order.
    pub fn append_u32(&mut self, value: u32) -> Result<(), BufferError> {
        self.append(&value.to_ne_bytes())
    }

    /// Append an `i64` in host byte order.
    pub fn append_i64(&mut self, value: i64) -> Result<(), BufferError> {
        self.append(&value.to_ne_bytes())
    }

    /// Append an `f64` in host byte order.
    pub fn append_f64(&mut self, value: f64) -> Result<(), BufferError> {
        self.append(&value.to_ne_bytes())
    }

    /// Drop `n` bytes from the front of the live window.
    ///
    /// Asking for more than is buffered does nothing.
    pub fn consume(&mut self, n: usize) {
        if n > self.len() {
            return;
        }
        self.data_start += n;
        if self.data_start == self.data_end {
            // Empty window: rewind for free instead of waiting for a compact.
            self.data_start = 0;
            self.data_end = 0;
        }
    }

    /// Move the live window down to offset zero.
    pub fn compact(&mut self) {
        if self.data_start == 0 {
            return;
        }
        let live = self.len();
        self.storage.copy_within(self.data_start..self.data_end, 0);
        self.data_start = 0;
        self.data_end = live;
    }

    /// Keep only the first `len` live bytes.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.data_end = self.data_start + len;
        }
    }

    /// Overwrite four live bytes at `offset` with `value` in host byte order.
    ///
    /// Used to backpatch length prefixes. Returns `false` if the range is not
    /// live.
    pub fn patch_u32(&mut self, offset: usize, value: u32) -> bool {
        let live = &mut self.storage[self.data_start..self.data_end];
        match live.get_mut(offset..offset.saturating_add(4)) {
            Some(dst) => {
                dst.copy_from_slice(&value.to_ne_bytes());
                true
            }
            None => false,
        }
    }

    /// Drop all live bytes, keeping the allocation.
    pub fn clear(&mut self) {
        self.data_start = 0;
        self.data_end = 0;
    }

    /// Reallocate to `new_capacity`, carrying the live bytes over to offset 0.
    fn grow(&mut self, new_capacity: usize) -> Result<(), BufferError> {
        let mut fresh = Vec::new();
        fresh
            .try_reserve_exact(new_capacity)
            .map_err(|_| BufferError::Alloc {
                requested: new_capacity,
            })?;
        fresh.extend_from_slice(self.data());
        let live = fresh.len();
        fresh.resize(new_capacity, 0);

        self.storage = fresh;
        self.data_start = 0;
        self.data_end = live;
        Ok(())
    }
}

impl std::fmt::Debug for ElasticBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticBuffer")
            .field("capacity", &self.capacity())
            .field("data_start", &self.data_start)
            .field("data_end", &self.data_end)
            .finish()
    }
}
