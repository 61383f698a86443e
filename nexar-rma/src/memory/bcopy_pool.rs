use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Lock-free pool of fixed-size bounce buffers for buffered-copy fragments.
///
/// Checkout pops a preallocated chunk, or allocates a fresh one when the pool
/// is empty. Chunks return to the pool on drop; the pool never grows beyond
/// its initial count.
pub struct BcopyPool {
    chunks: ArrayQueue<Vec<u8>>,
    chunk_bytes: usize,
}

impl BcopyPool {
    /// Create a pool of `count` chunks of `chunk_bytes` each.
    pub fn new(count: usize, chunk_bytes: usize) -> Arc<Self> {
        let chunks = ArrayQueue::new(count.max(1));
        for _ in 0..count {
            let _ = chunks.push(Vec::with_capacity(chunk_bytes));
        }
        Arc::new(Self {
            chunks,
            chunk_bytes,
        })
    }

    /// Largest fragment one chunk carries.
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Chunks currently idle in the pool.
    pub fn available(&self) -> usize {
        self.chunks.len()
    }

    /// Check out a zeroed buffer of `len` bytes (at most `chunk_bytes`).
    pub fn checkout(self: &Arc<Self>, len: usize) -> BounceBuf {
        let len = len.min(self.chunk_bytes);
        let mut buf = self
            .chunks
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.chunk_bytes));
        buf.resize(len, 0);
        BounceBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn return_buf(&self, mut buf: Vec<u8>) {
        if buf.capacity() <= self.chunk_bytes * 4 {
            buf.clear();
            let _ = self.chunks.push(buf);
        }
    }
}

/// A chunk checked out from a `BcopyPool`. Derefs to `[u8]`.
pub struct BounceBuf {
    buf: Option<Vec<u8>>,
    pool: Arc<BcopyPool>,
}

impl Deref for BounceBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for BounceBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for BounceBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.return_buf(buf);
        }
    }
}
