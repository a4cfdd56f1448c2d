//! Recyclable Byte Buffer Pool
//!
//! The analysis path hands fixed-size PCM chunks to a consumer on another
//! thread. To keep that path allocation-free in steady state, chunk backing
//! arrays come from this pool and are returned once the consumer is done.
//!
//! Buffers are size-class-exact: `get` always returns a buffer of the
//! configured size, and `put` discards anything else.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};

/// Snapshot of pool counters. All counters are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers served from the free list
    pub hits: u64,
    /// Buffers freshly allocated
    pub misses: u64,
    /// Returned buffers rejected (wrong size)
    pub discarded: u64,
}

/// Fixed-size byte buffer pool
pub struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    discarded: AtomicU64,
}

impl BufferPool {
    /// Create a pool serving buffers of exactly `size` bytes.
    pub fn new(size: usize) -> CoreResult<Self> {
        if size == 0 {
            return Err(CoreError::InvalidPoolSize(size));
        }
        Ok(Self {
            size,
            free: Mutex::new(Vec::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        })
    }

    /// The configured buffer size in bytes
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Get a buffer of exactly `buffer_size` bytes.
    ///
    /// Recycled buffers keep their previous contents; callers overwrite the
    /// full length before handing the buffer on.
    pub fn get(&self) -> Vec<u8> {
        if let Some(buf) = self.free.lock().pop() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return buf;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        vec![0u8; self.size]
    }

    /// Return a buffer to the pool.
    ///
    /// Buffers whose length is not exactly `buffer_size` are discarded and
    /// counted; they are never recycled.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.size {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.free.lock().push(buf);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}
