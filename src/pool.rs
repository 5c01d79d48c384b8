//! Pooled scratch buffers for rendering fetch inputs and collecting
//! subrequest responses.

use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// A shared pool of [`BytesMut`] scratch buffers.
///
/// Acquired buffers are returned automatically when the [`BufferLease`] is
/// dropped, cleared but with their capacity intact, bounding allocation
/// churn under load.
#[derive(Clone, Default)]
pub struct BufferPool {
    buffers: Arc<Mutex<Vec<BytesMut>>>,
}

/// Buffers larger than this are dropped instead of pooled, so one huge
/// response does not pin its allocation forever.
const MAX_POOLED_CAPACITY: usize = 4 * 1024 * 1024;

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a buffer with at least `capacity_hint` bytes of capacity.
    ///
    /// The hint usually comes from the single-flight size estimator; zero
    /// means "no idea", which yields a plain empty buffer.
    pub fn acquire(&self, capacity_hint: usize) -> BufferLease {
        let mut buffer = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_default();
        if buffer.capacity() < capacity_hint {
            buffer.reserve(capacity_hint - buffer.capacity());
        }
        BufferLease {
            pool: self.clone(),
            buffer: Some(buffer),
        }
    }

    fn release(&self, mut buffer: BytesMut) {
        if buffer.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buffer.clear();
        self.buffers.lock().push(buffer);
    }
}

/// An acquired pool buffer. Dereferences to [`BytesMut`].
pub struct BufferLease {
    pool: BufferPool,
    buffer: Option<BytesMut>,
}

impl BufferLease {
    /// Freeze the buffer contents into [`bytes::Bytes`], consuming the
    /// lease. The buffer's remaining allocation is not returned to the pool.
    pub fn freeze(mut self) -> bytes::Bytes {
        self.buffer
            .take()
            .unwrap_or_default()
            .freeze()
    }
}

impl Deref for BufferLease {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buffer
            .as_ref()
            .expect("buffer is only taken on freeze")
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buffer
            .as_mut()
            .expect("buffer is only taken on freeze")
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    #[test]
    fn lease_returns_cleared_buffer_to_pool() {
        let pool = BufferPool::new();
        {
            let mut lease = pool.acquire(0);
            lease.put_slice(b"hello");
            assert_eq!(&lease[..], b"hello");
        }
        let lease = pool.acquire(0);
        assert!(lease.is_empty());
        assert!(lease.capacity() >= 5);
    }

    #[test]
    fn acquire_honors_capacity_hint() {
        let pool = BufferPool::new();
        let lease = pool.acquire(1024);
        assert!(lease.capacity() >= 1024);
    }

    #[test]
    fn freeze_keeps_contents() {
        let pool = BufferPool::new();
        let mut lease = pool.acquire(0);
        lease.put_slice(b"{\"data\":{}}");
        assert_eq!(&lease.freeze()[..], b"{\"data\":{}}");
    }
}
