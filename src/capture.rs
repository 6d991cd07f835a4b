//! Per-camera capture orchestration.
//!
//! Each camera runs an orchestrator loop (persistent or one-shot) feeding the
//! camera ring, and a dispatcher that drains the ring into the shared worker
//! pool. The persistent loop enforces the latest-frame policy: every tick
//! drains the decoder hand-off and keeps only the newest frame, releasing the
//! rest.

use crate::circuit::{CircuitBreaker, CircuitError};
use crate::decoder::{capture_one_shot, DecoderError, DecoderSupervisor};
use crate::kv::FrameStore;
use crate::memory::MemoryController;
use crate::metadata::MetadataEmitter;
use crate::metrics::METRICS;
use crate::monitor::CameraMonitor;
use crate::pool::FramePool;
use crate::publisher::FramePublisher;
use crate::ring::{Frame, FrameRing, PushOutcome};
use crate::worker::{Job, JobError, SubmitError, WorkerPool};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// Reported frame dimensions assume the decoder's 720p default; the JPEG
// header is not parsed.
const FRAME_WIDTH: u32 = 1280;
const FRAME_HEIGHT: u32 = 720;
const FRAME_ENCODING: &str = "jpeg";

/// Consecutive empty ticks tolerated before the persistent path records a
/// health failure.
const MAX_EMPTY_TICKS: u32 = 5;

/// Everything one camera pipeline needs.
pub struct CameraPipelineParams {
    pub camera_id: String,
    pub camera_name: Option<String>,
    pub url: String,
    pub interval: Duration,
    pub use_persistent: bool,
    pub quality: u32,
    pub pool: Arc<FramePool>,
    pub ring: Arc<FrameRing>,
    pub workers: Arc<WorkerPool>,
    pub publisher: Arc<dyn FramePublisher>,
    pub publisher_type: &'static str,
    pub store: Arc<FrameStore>,
    pub metadata: Arc<MetadataEmitter>,
    pub monitor: Arc<CameraMonitor>,
    pub memory: Option<Arc<MemoryController>>,
    pub breaker: Arc<CircuitBreaker>,
    pub decoder: Option<Arc<DecoderSupervisor>>,
}

/// Orchestrator statistics snapshot.
#[derive(Debug, Default, Clone)]
pub struct PipelineStats {
    pub no_frame_available: u64,
    pub worker_pool_full: u64,
    pub frames_enqueued: u64,
}

/// One camera's capture-to-delivery pipeline.
pub struct CameraPipeline {
    camera_id: Arc<str>,
    camera_name: Option<String>,
    url: String,
    interval: Duration,
    use_persistent: bool,
    quality: u32,

    pool: Arc<FramePool>,
    ring: Arc<FrameRing>,
    workers: Arc<WorkerPool>,
    publisher: Arc<dyn FramePublisher>,
    publisher_type: &'static str,
    store: Arc<FrameStore>,
    metadata: Arc<MetadataEmitter>,
    monitor: Arc<CameraMonitor>,
    memory: Option<Arc<MemoryController>>,
    breaker: Arc<CircuitBreaker>,
    decoder: Option<Arc<DecoderSupervisor>>,

    cancel: CancellationToken,
    no_frame_available: AtomicU64,
    worker_pool_full: AtomicU64,
    frames_enqueued: AtomicU64,
}

impl CameraPipeline {
    pub fn new(params: CameraPipelineParams, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            camera_id: Arc::from(params.camera_id.as_str()),
            camera_name: params.camera_name,
            url: params.url,
            interval: params.interval,
            use_persistent: params.use_persistent,
            quality: params.quality,
            pool: params.pool,
            ring: params.ring,
            workers: params.workers,
            publisher: params.publisher,
            publisher_type: params.publisher_type,
            store: params.store,
            metadata: params.metadata,
            monitor: params.monitor,
            memory: params.memory,
            breaker: params.breaker,
            decoder: params.decoder,
            cancel: parent.child_token(),
            no_frame_available: AtomicU64::new(0),
            worker_pool_full: AtomicU64::new(0),
            frames_enqueued: AtomicU64::new(0),
        })
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            no_frame_available: self.no_frame_available.load(Ordering::Relaxed),
            worker_pool_full: self.worker_pool_full.load(Ordering::Relaxed),
            frames_enqueued: self.frames_enqueued.load(Ordering::Relaxed),
        }
    }

    /// Start the orchestrator and dispatcher tasks (and the decoder in
    /// persistent mode).
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.use_persistent {
            let decoder = self
                .decoder
                .clone()
                .ok_or_else(|| anyhow::anyhow!("persistent mode requires a decoder supervisor"))?;
            decoder.start().await?;

            let pipeline = self.clone();
            tokio::spawn(async move { pipeline.run_persistent(decoder).await });
        } else {
            let pipeline = self.clone();
            tokio::spawn(async move { pipeline.run_one_shot().await });
        }

        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run_dispatcher().await });

        info!(
            camera_id = %self.camera_id,
            camera_name = self.camera_name.as_deref().unwrap_or(""),
            persistent = self.use_persistent,
            interval_ms = self.interval.as_millis() as u64,
            "camera pipeline started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(decoder) = &self.decoder {
            decoder.stop().await;
        }
    }

    /// Persistent-mode orchestrator: consume the decoder hand-off at the
    /// target rate, delivering only the newest frame per tick.
    pub(crate) async fn run_persistent(self: Arc<Self>, decoder: Arc<DecoderSupervisor>) {
        let mut last_tick = Instant::now() - self.interval;
        let mut empty_streak = 0u32;

        loop {
            if !self.pace(&mut last_tick).await {
                break;
            }
            if !self.apply_memory_directives().await {
                continue;
            }

            let Some(mut frame) = decoder.try_get() else {
                self.no_frame_available.fetch_add(1, Ordering::Relaxed);
                empty_streak += 1;
                if empty_streak >= MAX_EMPTY_TICKS {
                    self.monitor
                        .record_failure(&self.camera_id, "no frames available from decoder");
                    empty_streak = 0;
                }
                continue;
            };
            empty_streak = 0;

            // Latest-frame flush: drain everything queued and keep only the
            // most recent; intermediate frames release on drop.
            let mut flushed = 0u64;
            while let Some(newer) = decoder.try_get() {
                frame = newer;
                flushed += 1;
            }
            if flushed > 0 {
                METRICS
                    .frames_dropped
                    .with_label_values(&[&self.camera_id, "flushed_old_frames"])
                    .inc_by(flushed);
                debug!(camera_id = %self.camera_id, flushed, "flushed stale frames");
            }

            self.monitor.record_success(&self.camera_id);
            self.enqueue(frame);
        }

        debug!(camera_id = %self.camera_id, "persistent orchestrator stopped");
    }

    /// One-shot orchestrator: a fresh decoder invocation per tick, guarded
    /// by the circuit breaker.
    pub(crate) async fn run_one_shot(self: Arc<Self>) {
        let mut last_tick = Instant::now() - self.interval;

        loop {
            if !self.pace(&mut last_tick).await {
                break;
            }
            if !self.apply_memory_directives().await {
                continue;
            }

            let result = self
                .breaker
                .call(|| capture_one_shot(&self.url, self.quality, &self.cancel))
                .await;

            METRICS
                .circuit_breaker_state
                .with_label_values(&[self.breaker.name()])
                .set(self.breaker.state().as_gauge());

            match result {
                Ok(data) => {
                    self.monitor.record_success(&self.camera_id);
                    // The captured buffer joins the camera pool's rotation
                    // when the frame is released.
                    let frame = Frame::new(self.camera_id.clone(), data, self.pool.clone());
                    self.enqueue(frame);
                }
                Err(CircuitError::Open { .. }) => {
                    METRICS
                        .frames_dropped
                        .with_label_values(&[&self.camera_id, "circuit_open"])
                        .inc();
                    debug!(camera_id = %self.camera_id, "capture skipped, circuit open");
                }
                Err(CircuitError::Inner(DecoderError::Cancelled)) => break,
                Err(CircuitError::Inner(err)) => {
                    METRICS
                        .frames_dropped
                        .with_label_values(&[&self.camera_id, err.kind_label()])
                        .inc();
                    self.monitor.record_failure(&self.camera_id, &err.to_string());
                    warn!(
                        camera_id = %self.camera_id,
                        error = %err,
                        error_type = err.kind_label(),
                        "capture failed"
                    );
                }
            }
        }

        debug!(camera_id = %self.camera_id, "one-shot orchestrator stopped");
    }

    /// Dispatcher: drain the ring into the worker pool, falling back to
    /// synchronous execution when the queue is full.
    pub(crate) async fn run_dispatcher(self: Arc<Self>) {
        loop {
            let Some(frame) = self.ring.pop_blocking(&self.cancel).await else {
                break;
            };
            METRICS
                .buffer_size
                .with_label_values(&[&self.camera_id])
                .set(self.ring.len() as i64);

            let job = Box::new(FrameJob::new(
                frame,
                self.publisher.clone(),
                self.publisher_type,
                self.store.clone(),
                self.metadata.clone(),
            ));

            match self.workers.try_submit(job) {
                Ok(()) => {}
                Err(SubmitError::QueueFull(job)) => {
                    // Designated overflow path: run on the dispatcher's own
                    // stack.
                    self.worker_pool_full.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) = job.process().await {
                        debug!(camera_id = %self.camera_id, error = %err, "inline job failed");
                    }
                }
                Err(SubmitError::PoolShutdown(job)) => {
                    drop(job);
                    break;
                }
            }
        }
        debug!(camera_id = %self.camera_id, "dispatcher stopped");
    }

    /// Sleep out the remainder of the capture interval. Returns false when
    /// cancelled.
    async fn pace(&self, last_tick: &mut Instant) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let elapsed = last_tick.elapsed();
        if elapsed < self.interval {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.interval - elapsed) => {}
            }
        }
        *last_tick = Instant::now();
        true
    }

    /// Apply memory controller directives. Returns false when this tick
    /// should be skipped (pause).
    async fn apply_memory_directives(&self) -> bool {
        let Some(memory) = &self.memory else {
            return true;
        };

        if memory.should_pause() {
            METRICS
                .camera_paused
                .with_label_values(&[&self.camera_id])
                .inc();
            let delay = memory.throttle_delay(&self.camera_id);
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            return false;
        }

        if memory.should_throttle() {
            METRICS
                .camera_throttled
                .with_label_values(&[&self.camera_id])
                .inc();
            let delay = memory.throttle_delay(&self.camera_id);
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        true
    }

    fn enqueue(&self, frame: Frame) {
        match self.ring.push(frame) {
            PushOutcome::Stored => {}
            PushOutcome::Replaced => {
                METRICS
                    .frames_dropped
                    .with_label_values(&[&self.camera_id, "ring_replaced"])
                    .inc();
            }
        }
        self.frames_enqueued.fetch_add(1, Ordering::Relaxed);
        METRICS
            .buffer_size
            .with_label_values(&[&self.camera_id])
            .set(self.ring.len() as i64);
    }
}

/// The canonical processing path for one frame: publish, mirror to the
/// store, emit metadata, release. Errors are logged and counted; they never
/// reach the orchestrator.
pub struct FrameJob {
    id: String,
    frame: Frame,
    publisher: Arc<dyn FramePublisher>,
    publisher_type: &'static str,
    store: Arc<FrameStore>,
    metadata: Arc<MetadataEmitter>,
}

impl FrameJob {
    pub fn new(
        frame: Frame,
        publisher: Arc<dyn FramePublisher>,
        publisher_type: &'static str,
        store: Arc<FrameStore>,
        metadata: Arc<MetadataEmitter>,
    ) -> Self {
        let id = format!(
            "{}-{}",
            frame.camera_id(),
            frame.timestamp().timestamp_nanos_opt().unwrap_or_default()
        );
        Self {
            id,
            frame,
            publisher,
            publisher_type,
            store,
            metadata,
        }
    }
}

#[async_trait]
impl Job for FrameJob {
    fn id(&self) -> &str {
        &self.id
    }

    async fn process(self: Box<Self>) -> Result<(), JobError> {
        let camera_id = self.frame.camera_id().to_string();
        let timestamp = self.frame.timestamp();
        let size = self.frame.len();

        let publish_started = Instant::now();
        let publish_result = self
            .publisher
            .publish(&camera_id, self.frame.data(), timestamp)
            .await;

        let mut failure = None;
        match publish_result {
            Ok(()) => {
                METRICS
                    .publish_latency
                    .with_label_values(&[self.publisher_type])
                    .observe(publish_started.elapsed().as_secs_f64());
            }
            Err(err) => {
                warn!(camera_id, error = %err, "frame publish failed");
                failure = Some(err.to_string());
            }
        }

        // The store mirror is independent of publish success.
        if self.store.enabled() {
            match self.store.save(&camera_id, timestamp, self.frame.data()).await {
                Ok(key) => {
                    METRICS
                        .storage_operations
                        .with_label_values(&["save", "success"])
                        .inc();
                    if self.metadata.enabled() {
                        if let Err(err) = self
                            .metadata
                            .emit_frame(
                                &camera_id,
                                timestamp,
                                &key,
                                FRAME_WIDTH,
                                FRAME_HEIGHT,
                                size,
                                FRAME_ENCODING,
                            )
                            .await
                        {
                            debug!(camera_id, error = %err, "frame metadata emit failed");
                        }
                    }
                }
                Err(err) => {
                    METRICS
                        .storage_operations
                        .with_label_values(&["save", "error"])
                        .inc();
                    warn!(camera_id, error = %err, "frame store write failed");
                }
            }
        } else if self.metadata.enabled() {
            if let Err(err) = self
                .metadata
                .emit_frame(
                    &camera_id,
                    timestamp,
                    "",
                    FRAME_WIDTH,
                    FRAME_HEIGHT,
                    size,
                    FRAME_ENCODING,
                )
                .await
            {
                debug!(camera_id, error = %err, "frame metadata emit failed");
            }
        }

        METRICS
            .frames_processed
            .with_label_values(&[&camera_id])
            .inc();
        METRICS
            .capture_latency
            .with_label_values(&[&camera_id])
            .observe(self.frame.captured_at().elapsed().as_secs_f64());
        METRICS
            .frame_size_bytes
            .with_label_values(&[&camera_id])
            .observe(size as f64);

        // Dropping `self.frame` here returns the buffer to its pool.
        match failure {
            None => Ok(()),
            Some(message) => Err(JobError::new(message)),
        }
    }
}
