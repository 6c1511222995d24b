//! Object pools for reducing allocation overhead
//!
//! Work items, side-channel events and encode buffers are recycled through
//! bounded lock-free free lists. Every object handed back with [`ObjectPool::put`]
//! is reset before it becomes visible to the next [`ObjectPool::get`], so no
//! caller can observe state left behind by a previous user.

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

/// Maximum number of objects to keep in a pool by default
const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Default capacity for pooled encode buffers
const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Maximum buffer size to return to pool (don't pool oversized buffers)
const MAX_POOLED_BUFFER_SIZE: usize = 16384;

/// Types that can be returned to an [`ObjectPool`]
pub trait Reset {
    /// Clear all caller-visible state
    fn reset(&mut self);

    /// Whether the object is still worth keeping after use
    fn reusable(&self) -> bool {
        true
    }
}

/// A bounded pool of reusable objects
///
/// Safe for concurrent `get`/`put`; which pooled instance a `get` returns is
/// unspecified.
pub struct ObjectPool<T> {
    pool: ArrayQueue<T>,
}

impl<T: Reset + Default> ObjectPool<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pool: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Take an object from the pool, or build a fresh one if the pool is empty
    #[inline]
    pub fn get(&self) -> T {
        self.pool.pop().unwrap_or_default()
    }

    /// Reset an object and return it to the pool
    ///
    /// Objects that report themselves as not reusable, or that arrive while the
    /// pool is full, are dropped.
    #[inline]
    pub fn put(&self, mut obj: T) {
        if !obj.reusable() {
            return;
        }
        obj.reset();
        let _ = self.pool.push(obj);
    }

    /// Number of objects currently pooled
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

impl<T: Reset + Default> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode buffer wrapper so `BytesMut` can live in an [`ObjectPool`]
#[derive(Debug)]
pub struct Buffer(pub BytesMut);

impl Default for Buffer {
    fn default() -> Self {
        Buffer(BytesMut::with_capacity(DEFAULT_BUFFER_SIZE))
    }
}

impl Reset for Buffer {
    fn reset(&mut self) {
        self.0.clear();
    }

    fn reusable(&self) -> bool {
        self.0.capacity() <= MAX_POOLED_BUFFER_SIZE
    }
}
