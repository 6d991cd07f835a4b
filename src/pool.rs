//! Per-camera pools of reusable frame buffers.
//!
//! Each camera owns its own pool so a buffer can never escape to another
//! camera's pipeline. Buffers above the pooling cap are dropped instead of
//! being retained.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Buffers with more capacity than this are never retained by the pool.
pub const MAX_POOLED_CAPACITY: usize = 2 * 1024 * 1024;

/// Default cap on retained free buffers per pool.
const DEFAULT_MAX_FREE: usize = 10;

/// Pool statistics snapshot.
#[derive(Debug, Default, Clone)]
pub struct PoolStats {
    pub pooled: usize,
    pub acquired: u64,
    pub reused: u64,
    pub discarded: u64,
}

/// A free-list of byte buffers owned by a single camera pipeline.
pub struct FramePool {
    free: Mutex<Vec<Vec<u8>>>,
    max_capacity: usize,
    max_free: usize,
    acquired: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

impl FramePool {
    /// Create a pool holding up to `prealloc` empty buffers at full capacity.
    pub fn new(prealloc: usize) -> Self {
        let mut free = Vec::with_capacity(prealloc);
        for _ in 0..prealloc {
            free.push(Vec::with_capacity(MAX_POOLED_CAPACITY));
        }
        Self {
            free: Mutex::new(free),
            max_capacity: MAX_POOLED_CAPACITY,
            max_free: prealloc.max(DEFAULT_MAX_FREE),
            acquired: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Return a zeroed buffer of length exactly `size`.
    ///
    /// Reuses a pooled buffer when one with sufficient capacity exists,
    /// otherwise allocates fresh.
    pub fn acquire(&self, size: usize) -> Vec<u8> {
        self.acquired.fetch_add(1, Ordering::Relaxed);

        if size <= self.max_capacity {
            let mut free = self.free.lock();
            if let Some(pos) = free.iter().position(|buf| buf.capacity() >= size) {
                let mut buf = free.swap_remove(pos);
                drop(free);
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.resize(size, 0);
                return buf;
            }
        }

        vec![0u8; size]
    }

    /// Return a buffer to the pool. Oversized buffers are discarded, and so
    /// is anything beyond the free-list cap.
    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.max_capacity {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut free = self.free.lock();
        if free.len() >= self.max_free {
            drop(free);
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buf.clear();
        free.push(buf);
    }

    /// Drop every pooled free buffer, returning how many were reclaimed.
    ///
    /// Used by the memory controller to release heap back under pressure.
    pub fn trim(&self) -> usize {
        let mut free = self.free.lock();
        let reclaimed = free.len();
        free.clear();
        free.shrink_to_fit();
        reclaimed
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pooled: self.free.lock().len(),
            acquired: self.acquired.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_returns_exact_length() {
        let pool = FramePool::new(0);
        let buf = pool.acquire(1234);
        assert_eq!(buf.len(), 1234);
    }

    #[test]
    fn test_release_then_reuse() {
        let pool = FramePool::new(0);
        let buf = pool.acquire(512);
        let cap = buf.capacity();
        pool.release(buf);

        let again = pool.acquire(256);
        assert_eq!(again.len(), 256);
        assert_eq!(again.capacity(), cap);
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn test_oversized_buffer_discarded() {
        let pool = FramePool::new(0);
        let big = vec![0u8; MAX_POOLED_CAPACITY + 1];
        pool.release(big);
        assert_eq!(pool.stats().pooled, 0);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn test_trim_drops_free_buffers() {
        let pool = FramePool::new(4);
        assert_eq!(pool.stats().pooled, 4);
        assert_eq!(pool.trim(), 4);
        assert_eq!(pool.stats().pooled, 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = Arc::new(FramePool::new(2));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let buf = pool.acquire(1024);
                    assert_eq!(buf.len(), 1024);
                    pool.release(buf);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.stats().acquired, 800);
    }
}
