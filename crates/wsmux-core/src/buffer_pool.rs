//! Shared pool of fragment-assembly buffers.
//!
//! Joining a fragmented message buffers every non-final fragment. Sessions
//! churn through these buffers constantly, so they are recycled through an
//! `object-pool` free list instead of being reallocated per message. A
//! [`PooledBuf`] returns to the pool when dropped — dropping it is the
//! disposal step the copy path relies on.

use object_pool::Pool;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Initial capacity of pooled buffers. Fragmented messages larger than this
/// grow the buffer; it keeps its larger allocation when recycled.
const INITIAL_BUFFER_SIZE: usize = 32 * 1024;

/// Buffers retained by the pool when idle.
const POOL_CAPACITY: usize = 32;

/// A thread-safe free list of reusable byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Pool<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            pool: Arc::new(Pool::new(POOL_CAPACITY, || {
                Vec::with_capacity(INITIAL_BUFFER_SIZE)
            })),
        }
    }

    /// Take a buffer from the pool. The buffer is empty; it returns to the
    /// pool when the [`PooledBuf`] is dropped.
    pub fn acquire(&self) -> PooledBuf {
        let mut inner = self
            .pool
            .pull_owned(|| Vec::with_capacity(INITIAL_BUFFER_SIZE));
        // Buffers come back in whatever state they were dropped.
        inner.clear();
        PooledBuf { inner }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer checked out of a [`BufferPool`].
pub struct PooledBuf {
    inner: object_pool::ReusableOwned<Vec<u8>>,
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

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.inner.as_slice()
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.inner.len())
            .field("capacity", &self.inner.capacity())
            .finish()
    }
}
