//! ## streamtap-core::alloc::pool
//! **Fixed-capacity capture buffers**
//!
//! The capture path draws one buffer per outstanding receive and hands the
//! filled buffer to the consumer. Dropping a [`PooledBuffer`] returns its block
//! to the free-list, so a filled buffer is never written by the capture path
//! while the consumer still holds it.
//!
//! Two exhaustion policies exist:
//! - [`PoolPolicy::Bounded`]: the capture path waits (in bounded slices) until
//!   the consumer releases a buffer. Memory stays at `capacity * buffer_size`.
//! - [`PoolPolicy::Grow`]: a fresh block is allocated instead of waiting. Slow
//!   consumers make memory grow; surplus blocks are freed on release.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::stats::PoolStats;
use crate::error::PoolError;

/// Behaviour of [`BufferPool::acquire`] when the free-list is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolPolicy {
    #[default]
    Bounded,
    Grow,
}

struct FreeList {
    buffers: Vec<Box<[u8]>>,
    closed: bool,
}

struct PoolInner {
    free: Mutex<FreeList>,
    released: Condvar,
    buffer_size: usize,
    capacity: usize,
    policy: PoolPolicy,
    stats: PoolStats,
}

impl PoolInner {
    fn release(&self, data: Box<[u8]>) {
        let mut free = self.free.lock();
        self.stats.increment_releases();
        if !free.closed && free.buffers.len() < self.capacity && data.len() == self.buffer_size {
            free.buffers.push(data);
        }
        drop(free);
        self.released.notify_one();
    }
}

/// Shared handle to a pool of equally sized byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize, policy: PoolPolicy) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }
        if buffer_size == 0 {
            return Err(PoolError::InvalidBufferSize);
        }

        let buffers = (0..capacity)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();

        Ok(Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(FreeList {
                    buffers,
                    closed: false,
                }),
                released: Condvar::new(),
                buffer_size,
                capacity,
                policy,
                stats: PoolStats::new(),
            }),
        })
    }

    /// Draws a free buffer.
    ///
    /// Under [`PoolPolicy::Bounded`] this blocks for at most `wait` and then
    /// returns [`PoolError::Exhausted`], letting the caller re-check its own
    /// shutdown flag before trying again.
    pub fn acquire(&self, wait: Duration) -> Result<PooledBuffer, PoolError> {
        let deadline = Instant::now() + wait;
        let mut free = self.inner.free.lock();
        loop {
            if free.closed {
                return Err(PoolError::Closed);
            }
            if let Some(data) = free.buffers.pop() {
                self.inner.stats.increment_acquisitions();
                return Ok(PooledBuffer::new(Arc::clone(&self.inner), data));
            }
            match self.inner.policy {
                PoolPolicy::Grow => {
                    drop(free);
                    self.inner.stats.increment_grown();
                    self.inner.stats.increment_acquisitions();
                    let data = vec![0u8; self.inner.buffer_size].into_boxed_slice();
                    return Ok(PooledBuffer::new(Arc::clone(&self.inner), data));
                }
                PoolPolicy::Bounded => {
                    self.inner.stats.increment_waits();
                    let timed_out = self
                        .inner
                        .released
                        .wait_until(&mut free, deadline)
                        .timed_out();
                    if timed_out && free.buffers.is_empty() && !free.closed {
                        return Err(PoolError::Exhausted);
                    }
                }
            }
        }
    }

    /// Non-blocking variant of [`acquire`](Self::acquire).
    pub fn try_acquire(&self) -> Option<PooledBuffer> {
        self.acquire(Duration::ZERO).ok()
    }

    /// Rejects further acquisitions and wakes every waiter. Buffers still held
    /// by consumers are freed when they are dropped.
    pub fn close(&self) {
        let mut free = self.inner.free.lock();
        free.closed = true;
        free.buffers.clear();
        drop(free);
        self.inner.released.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.free.lock().closed
    }

    /// Number of buffers currently on the free-list.
    pub fn free_len(&self) -> usize {
        self.inner.free.lock().buffers.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn policy(&self) -> PoolPolicy {
        self.inner.policy
    }

    pub fn stats(&self) -> &PoolStats {
        &self.inner.stats
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.inner.capacity)
            .field("buffer_size", &self.inner.buffer_size)
            .field("policy", &self.inner.policy)
            .field("free", &self.free_len())
            .finish()
    }
}

/// A buffer drawn from a [`BufferPool`]. Dereferences to the filled prefix.
pub struct PooledBuffer {
    data: Box<[u8]>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    #[inline]
    fn new(pool: Arc<PoolInner>, data: Box<[u8]>) -> Self {
        Self { data, len: 0, pool }
    }

    /// Whole block, for a receive call to write into.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Marks the first `len` bytes as filled (clamped to the capacity).
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.release(data);
    }
}
