//! Pooled copy buffers
//!
//! Pump tasks borrow a fixed-size buffer for their whole lifetime. The buffer
//! goes back to the pool when the guard drops, which also happens while a
//! panicking task unwinds.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Size of one pump buffer (32 KiB)
pub const PUMP_BUFFER_SIZE: usize = 32 * 1024;

/// Buffers kept around for reuse; extra buffers are freed on return.
const DEFAULT_MAX_IDLE: usize = 256;

/// Shared pool of fixed-size byte buffers
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<BytesMut>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(PUMP_BUFFER_SIZE)
    }
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self::with_max_idle(buffer_size, DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                max_idle,
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Take a zeroed buffer of `buffer_size` bytes from the pool.
    pub fn acquire(&self) -> PooledBuf {
        let buf = self.inner.idle.lock().pop().unwrap_or_else(|| {
            let mut buf = BytesMut::with_capacity(self.inner.buffer_size);
            buf.resize(self.inner.buffer_size, 0);
            buf
        });
        PooledBuf {
            buf: Some(buf),
            pool: self.inner.clone(),
        }
    }

    /// Number of buffers currently waiting for reuse
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }
}

/// Buffer borrowed from a [`BufferPool`], returned on drop
pub struct PooledBuf {
    buf: Option<BytesMut>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let mut idle = self.pool.idle.lock();
            if idle.len() < self.pool.max_idle && buf.len() == self.pool.buffer_size {
                idle.push(buf);
            }
        }
    }
}
