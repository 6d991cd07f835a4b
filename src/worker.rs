//! Shared worker pool processing frame jobs off a bounded queue.
//!
//! Submission never blocks: a full queue hands the job back to the caller,
//! which runs it on its own stack (the designated overflow path).

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Error reported by a job's `process`. Jobs handle their own failures
/// internally; this only feeds the pool's error tally.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct JobError(String);

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A unit of work owned by whoever holds the queue slot.
#[async_trait]
pub trait Job: Send + 'static {
    fn id(&self) -> &str;

    async fn process(self: Box<Self>) -> Result<(), JobError>;
}

/// Why a submission was refused. The job is handed back so the caller can
/// run it synchronously or drop it.
#[derive(Error)]
pub enum SubmitError {
    #[error("worker queue is full")]
    QueueFull(Box<dyn Job>),

    #[error("worker pool is shut down")]
    PoolShutdown(Box<dyn Job>),
}

impl SubmitError {
    pub fn into_job(self) -> Box<dyn Job> {
        match self {
            SubmitError::QueueFull(job) | SubmitError::PoolShutdown(job) => job,
        }
    }
}

impl fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::QueueFull(job) => write!(f, "QueueFull({})", job.id()),
            SubmitError::PoolShutdown(job) => write!(f, "PoolShutdown({})", job.id()),
        }
    }
}

/// Pool statistics snapshot.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub workers: usize,
    pub queue_size: usize,
    pub capacity: usize,
    pub processing: usize,
    pub total_processed: u64,
    pub total_errors: u64,
}

struct Shared {
    processing: AtomicUsize,
    total_processed: AtomicU64,
    total_errors: AtomicU64,
}

/// Fixed workforce over a shared bounded FIFO queue.
pub struct WorkerPool {
    tx: parking_lot::Mutex<Option<flume::Sender<Box<dyn Job>>>>,
    rx: flume::Receiver<Box<dyn Job>>,
    workers: usize,
    capacity: usize,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_size: usize, parent: &CancellationToken) -> Arc<Self> {
        let workers = workers.max(1);
        // A zero-capacity flume channel is a rendezvous: try_send would then
        // depend on whether a worker happens to be parked in recv. The queue
        // is allocated with at least one slot and capacity 0 is enforced in
        // try_submit instead, so overflow behavior stays deterministic.
        let (tx, rx) = flume::bounded::<Box<dyn Job>>(queue_size.max(1));
        let shared = Arc::new(Shared {
            processing: AtomicUsize::new(0),
            total_processed: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        });
        let cancel = parent.child_token();

        let pool = Arc::new(Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            rx: rx.clone(),
            workers,
            capacity: queue_size,
            shared: shared.clone(),
            cancel: cancel.clone(),
            handles: parking_lot::Mutex::new(Vec::with_capacity(workers)),
        });

        let mut handles = pool.handles.lock();
        for worker_id in 0..workers {
            let rx = rx.clone();
            let shared = shared.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(worker_loop(worker_id, rx, shared, cancel)));
        }
        drop(handles);

        info!(workers, queue_size, "worker pool started");
        pool
    }

    /// Enqueue a job without blocking. A refused job comes back inside the
    /// error so the caller can execute it inline.
    pub fn try_submit(&self, job: Box<dyn Job>) -> Result<(), SubmitError> {
        if self.capacity == 0 {
            return Err(SubmitError::QueueFull(job));
        }
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(SubmitError::PoolShutdown(job));
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(job)) => Err(SubmitError::QueueFull(job)),
            Err(flume::TrySendError::Disconnected(job)) => Err(SubmitError::PoolShutdown(job)),
        }
    }

    /// Close the queue, let workers drain in-flight jobs for up to five
    /// seconds, then cancel whatever remains.
    pub async fn shutdown(&self) {
        info!("shutting down worker pool");
        // Dropping the only sender closes the queue; workers drain what is
        // already enqueued.
        self.tx.lock().take();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        loop {
            if self.shared.processing.load(Ordering::Acquire) == 0 && self.rx.is_empty() {
                debug!("worker pool drained");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    processing = self.shared.processing.load(Ordering::Acquire),
                    queued = self.rx.len(),
                    "worker pool drain timed out, cancelling outstanding jobs"
                );
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        self.cancel.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers,
            queue_size: self.rx.len(),
            capacity: self.capacity,
            processing: self.shared.processing.load(Ordering::Acquire),
            total_processed: self.shared.total_processed.load(Ordering::Relaxed),
            total_errors: self.shared.total_errors.load(Ordering::Relaxed),
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: flume::Receiver<Box<dyn Job>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    debug!(worker_id, "worker started");
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = rx.recv_async() => match job {
                Ok(job) => job,
                // Queue closed and fully drained.
                Err(flume::RecvError::Disconnected) => break,
            },
        };

        shared.processing.fetch_add(1, Ordering::AcqRel);
        let result = job.process().await;
        shared.processing.fetch_sub(1, Ordering::AcqRel);
        shared.total_processed.fetch_add(1, Ordering::Relaxed);

        if let Err(err) = result {
            shared.total_errors.fetch_add(1, Ordering::Relaxed);
            debug!(worker_id, error = %err, "job failed");
        }
    }
    debug!(worker_id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingJob {
        id: String,
        counter: Arc<AtomicU32>,
        fail: bool,
    }

    impl CountingJob {
        fn boxed(counter: &Arc<AtomicU32>, fail: bool) -> Box<dyn Job> {
            Box::new(Self {
                id: "job".to_string(),
                counter: counter.clone(),
                fail,
            })
        }
    }

    #[async_trait]
    impl Job for CountingJob {
        fn id(&self) -> &str {
            &self.id
        }

        async fn process(self: Box<Self>) -> Result<(), JobError> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(JobError::new("synthetic failure"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_jobs_are_processed() {
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(2, 16, &cancel);
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..10 {
            pool.try_submit(CountingJob::boxed(&counter, false)).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) < 10 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(pool.stats().total_processed, 10);
        assert_eq!(pool.stats().total_errors, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_errors_are_counted() {
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(1, 8, &cancel);
        let counter = Arc::new(AtomicU32::new(0));

        pool.try_submit(CountingJob::boxed(&counter, true)).unwrap();
        pool.shutdown().await;

        assert_eq!(pool.stats().total_processed, 1);
        assert_eq!(pool.stats().total_errors, 1);
    }

    #[tokio::test]
    async fn test_zero_capacity_queue_refuses_every_submit() {
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(1, 0, &cancel);
        let counter = Arc::new(AtomicU32::new(0));

        // A rendezvous queue refuses try_send, so every submission falls
        // back to the caller.
        let result = pool.try_submit(CountingJob::boxed(&counter, false));
        match result {
            Err(SubmitError::QueueFull(job)) => {
                job.process().await.unwrap();
            }
            other => panic!("expected QueueFull, got {other:?}"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_refused() {
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(1, 8, &cancel);
        pool.shutdown().await;

        let counter = Arc::new(AtomicU32::new(0));
        assert!(matches!(
            pool.try_submit(CountingJob::boxed(&counter, false)),
            Err(SubmitError::PoolShutdown(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_drains_enqueued_jobs() {
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(1, 32, &cancel);
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..20 {
            pool.try_submit(CountingJob::boxed(&counter, false)).unwrap();
        }
        pool.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }
}
