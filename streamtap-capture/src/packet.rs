//! A captured frame.

use streamtap_core::alloc::PooledBuffer;

/// One raw IPv4 datagram (or several concatenated ones) delivered by a
/// capture socket. Dropping the frame returns its buffer to the pool.
#[derive(Debug)]
pub struct CapturedFrame {
    buffer: PooledBuffer,
    epoch: i64,
}

impl CapturedFrame {
    pub fn new(buffer: PooledBuffer, epoch: i64) -> Self {
        CapturedFrame { buffer, epoch }
    }

    /// Filled bytes of the frame.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Capture time in milliseconds since the UNIX epoch.
    #[inline]
    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
