//! Receive buffer pool. The transport acquires one buffer per datagram and
//! the buffer returns itself when the packet is done with it.

use std::sync::{Arc, Mutex};

/// A pooled buffer that returns itself to the pool when dropped.
pub struct PooledBuffer {
    buffer: Vec<u8>,
    shared: Arc<Shared>,
}

struct Shared {
    free: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
    buffer_size: usize,
}

impl PooledBuffer {
    /// Take the bytes out, leaving nothing to return to the pool.
    pub fn into_inner(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // buffers that grew or were taken are left to the allocator
        let size = self.shared.buffer_size;
        if self.buffer.capacity() < size || self.buffer.capacity() > size * 2 {
            return;
        }
        if let Ok(mut free) = self.shared.free.lock() {
            if free.len() < self.shared.max_pooled {
                free.push(std::mem::take(&mut self.buffer));
            }
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

/// Fixed-size buffer pool. Holds at most `pool_size` idle buffers; when it
/// runs dry, `acquire` allocates.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    pub fn new(pool_size: usize, buffer_size: usize) -> Self {
        let free = (0..pool_size).map(|_| vec![0u8; buffer_size]).collect();
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(free),
                max_pooled: pool_size,
                buffer_size,
            }),
        }
    }

    /// A zeroed buffer of `buffer_size` bytes.
    pub fn acquire(&self) -> PooledBuffer {
        let size = self.shared.buffer_size;
        let mut buffer = self
            .shared
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| Vec::with_capacity(size));
        buffer.clear();
        buffer.resize(size, 0);
        PooledBuffer {
            buffer,
            shared: self.shared.clone(),
        }
    }

    pub fn available(&self) -> usize {
        self.shared.free.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }
}
