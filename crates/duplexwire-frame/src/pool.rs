//! Shared scratch buffers for record decoding and message encoding.
//!
//! A single [`BufferPool`] is created by the host and cloned into every
//! connection. Buffers are checked out per read or write and return to the
//! pool when the [`PooledBuf`] guard drops, on every exit path.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use object_pool::Pool;

/// Default size of each pooled buffer (8 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Default number of buffers kept in the pool.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Buffers that grew beyond this multiple of the pool size are shrunk before
/// they go back, so one oversized message does not pin memory forever.
const SHRINK_FACTOR: usize = 4;

/// A cloneable handle to a process-wide buffer pool.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Pool<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Pool with default capacity and buffer size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_SIZE)
    }

    /// Pool holding `capacity` buffers of `buffer_size` bytes each.
    pub fn with_capacity(capacity: usize, buffer_size: usize) -> Self {
        let pool = Pool::new(capacity, move || Vec::with_capacity(buffer_size));
        Self {
            pool: Arc::new(pool),
            buffer_size,
        }
    }

    /// Check out an empty buffer. Falls back to a fresh allocation when the
    /// pool is exhausted.
    pub fn get(&self) -> PooledBuf {
        let mut reusable = self
            .pool
            .pull_owned(|| Vec::with_capacity(self.buffer_size));
        // Buffers come back in whatever state they were dropped in.
        reusable.clear();
        PooledBuf {
            inner: reusable,
            pool_buffer_size: self.buffer_size,
        }
    }

    /// Configured size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers currently idle in the pool.
    pub fn available(&self) -> usize {
        self.pool.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}

/// A checked-out buffer; returns to its pool on drop.
pub struct PooledBuf {
    inner: object_pool::ReusableOwned<Vec<u8>>,
    pool_buffer_size: usize,
}

impl PooledBuf {
    /// The pool's per-buffer size (not the current length).
    pub fn pool_buffer_size(&self) -> usize {
        self.pool_buffer_size
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if self.inner.capacity() > self.pool_buffer_size * SHRINK_FACTOR {
            self.inner.clear();
            self.inner.shrink_to(self.pool_buffer_size);
        }
    }
}
