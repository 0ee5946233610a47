use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Scratch buffer pool for request and response frames.
///
/// The handle is cheap to clone; all clones share the same set of retained buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buffers: Mutex<Vec<BytesMut>>,
    initial_capacity: usize,
    max_buffers: usize,
    max_retained_capacity: usize,
}

impl BufferPool {
    pub const DEFAULT_CAPACITY: usize = 16 * 1024;
    pub const DEFAULT_MAX_BUFFERS: usize = 64;
    pub const DEFAULT_MAX_RETAINED_CAPACITY: usize = 1024 * 1024;

    #[inline]
    pub fn new() -> Self {
        Self::with_limits(
            Self::DEFAULT_CAPACITY,
            Self::DEFAULT_MAX_BUFFERS,
            Self::DEFAULT_MAX_RETAINED_CAPACITY,
        )
    }

    /// Pool that allocates buffers of `initial_capacity` and keeps at most `max_buffers` of
    /// them, each no larger than `max_retained_capacity`.
    pub fn with_limits(
        initial_capacity: usize,
        max_buffers: usize,
        max_retained_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(Vec::with_capacity(max_buffers)),
                initial_capacity,
                max_buffers,
                max_retained_capacity,
            }),
        }
    }

    /// Take an empty buffer from the pool, allocating a new one if none is available.
    pub fn get(&self) -> PooledBuf {
        let buf = self
            .inner
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.inner.initial_capacity));

        PooledBuf {
            buf,
            pool: self.clone(),
        }
    }

    /// Number of buffers currently retained.
    #[inline]
    pub fn available(&self) -> usize {
        self.inner.buffers.lock().len()
    }

    fn put(&self, mut buf: BytesMut) {
        if buf.capacity() > self.inner.max_retained_capacity {
            return;
        }

        buf.clear();

        let mut buffers = self.inner.buffers.lock();
        if buffers.len() < self.inner.max_buffers {
            buffers.push(buf);
        }
    }
}

impl Default for BufferPool {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.available())
            .field("max_buffers", &self.inner.max_buffers)
            .finish()
    }
}

/// Buffer borrowed from a [`BufferPool`], returned to it (cleared) on drop.
pub struct PooledBuf {
    buf: BytesMut,
    pool: BufferPool,
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.buf.len())
            .field("capacity", &self.buf.capacity())
            .finish()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.put(mem::take(&mut self.buf));
    }
}
