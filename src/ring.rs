//! Captured frames and the per-camera drop-oldest ring.

use crate::pool::FramePool;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// One captured JPEG with its metadata.
///
/// A frame owns its payload buffer exclusively; the buffer returns to the
/// originating camera pool when the frame is dropped, so eviction, flushing,
/// shutdown and job completion all release it exactly once.
pub struct Frame {
    camera_id: Arc<str>,
    data: Option<Vec<u8>>,
    captured_at: Instant,
    timestamp: DateTime<Utc>,
    pool: Arc<FramePool>,
}

impl Frame {
    pub fn new(camera_id: Arc<str>, data: Vec<u8>, pool: Arc<FramePool>) -> Self {
        Self {
            camera_id,
            data: Some(data),
            captured_at: Instant::now(),
            timestamp: Utc::now(),
            pool,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.data.as_ref().map(Vec::len).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotonic capture instant, for latency measurements.
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Wall-clock capture time, embedded in keys and metadata.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(buf) = self.data.take() {
            self.pool.release(buf);
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("camera_id", &self.camera_id)
            .field("len", &self.len())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Outcome of pushing into the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The frame was stored with room to spare.
    Stored,
    /// The ring was full; the oldest frame was evicted to admit this one.
    Replaced,
}

/// Ring statistics snapshot.
#[derive(Debug, Clone)]
pub struct RingStats {
    pub size: usize,
    pub capacity: usize,
    pub total_pushed: u64,
    pub total_dropped: u64,
    pub drop_rate: f64,
}

/// Bounded FIFO of frames with drop-oldest semantics.
///
/// Single producer (the orchestrator) and single consumer (the dispatcher),
/// though the implementation tolerates more of either.
pub struct FrameRing {
    inner: Mutex<VecDeque<Frame>>,
    capacity: usize,
    notify: Notify,
    total_pushed: AtomicU64,
    total_dropped: AtomicU64,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            total_pushed: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    /// Insert a frame, evicting (and thereby releasing) the oldest when full.
    pub fn push(&self, frame: Frame) -> PushOutcome {
        self.total_pushed.fetch_add(1, Ordering::Relaxed);

        let outcome = {
            let mut inner = self.inner.lock();
            let outcome = if inner.len() >= self.capacity {
                let evicted = inner.pop_front();
                drop(evicted);
                self.total_dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Replaced
            } else {
                PushOutcome::Stored
            };
            inner.push_back(frame);
            outcome
        };

        self.notify.notify_one();
        outcome
    }

    /// Pop the oldest frame, non-blocking.
    pub fn pop(&self) -> Option<Frame> {
        self.inner.lock().pop_front()
    }

    /// Wait until a frame is available or the token is cancelled.
    pub async fn pop_blocking(&self, cancel: &CancellationToken) -> Option<Frame> {
        loop {
            if let Some(frame) = self.pop() {
                return Some(frame);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> RingStats {
        let total_pushed = self.total_pushed.load(Ordering::Relaxed);
        let total_dropped = self.total_dropped.load(Ordering::Relaxed);
        let drop_rate = if total_pushed > 0 {
            total_dropped as f64 / total_pushed as f64 * 100.0
        } else {
            0.0
        };
        RingStats {
            size: self.len(),
            capacity: self.capacity,
            total_pushed,
            total_dropped,
            drop_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_frame(pool: &Arc<FramePool>, fill: u8, len: usize) -> Frame {
        let mut buf = pool.acquire(len);
        buf.fill(fill);
        Frame::new(Arc::from("cam1"), buf, pool.clone())
    }

    #[test]
    fn test_frame_releases_buffer_on_drop() {
        let pool = Arc::new(FramePool::new(0));
        let frame = test_frame(&pool, 1, 64);
        assert_eq!(pool.stats().pooled, 0);
        drop(frame);
        assert_eq!(pool.stats().pooled, 1);
    }

    #[test]
    fn test_push_pop_fifo() {
        let pool = Arc::new(FramePool::new(0));
        let ring = FrameRing::new(4);
        ring.push(test_frame(&pool, 1, 8));
        ring.push(test_frame(&pool, 2, 8));

        assert_eq!(ring.pop().unwrap().data()[0], 1);
        assert_eq!(ring.pop().unwrap().data()[0], 2);
        assert!(ring.pop().is_none());
    }

    #[test]
    fn test_capacity_one_evicts_oldest() {
        let pool = Arc::new(FramePool::new(0));
        let ring = FrameRing::new(1);

        assert_eq!(ring.push(test_frame(&pool, 1, 8)), PushOutcome::Stored);
        assert_eq!(ring.push(test_frame(&pool, 2, 8)), PushOutcome::Replaced);

        let stats = ring.stats();
        assert_eq!(stats.total_pushed, 2);
        assert_eq!(stats.total_dropped, 1);
        assert_eq!(stats.size, 1);

        // The survivor is the newer frame; the evicted buffer went back to
        // the pool.
        assert_eq!(ring.pop().unwrap().data()[0], 2);
        assert_eq!(pool.stats().pooled, 1);
    }

    #[tokio::test]
    async fn test_pop_blocking_wakes_on_push() {
        let pool = Arc::new(FramePool::new(0));
        let ring = Arc::new(FrameRing::new(2));
        let cancel = CancellationToken::new();

        let waiter = {
            let ring = ring.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ring.pop_blocking(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ring.push(test_frame(&pool, 7, 8));

        let frame = waiter.await.unwrap();
        assert_eq!(frame.unwrap().data()[0], 7);
    }

    #[tokio::test]
    async fn test_pop_blocking_cancellation() {
        let ring = Arc::new(FrameRing::new(2));
        let cancel = CancellationToken::new();

        let waiter = {
            let ring = ring.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ring.pop_blocking(&cancel).await })
        };

        cancel.cancel();
        assert!(waiter.await.unwrap().is_none());
    }

    #[test]
    fn test_every_evicted_frame_released_once() {
        let pool = Arc::new(FramePool::new(0));
        let ring = FrameRing::new(2);
        for i in 0..10 {
            ring.push(test_frame(&pool, i, 16));
        }
        // 8 evicted and released, 2 still live in the ring.
        assert_eq!(pool.stats().pooled, 8);
        drop(ring);
        assert_eq!(pool.stats().pooled, 10);
    }
}
