//! External decoder ownership: persistent supervision and one-shot capture.
//!
//! Persistent mode keeps one long-running ffmpeg process per camera emitting
//! an MJPEG byte stream on stdout. A reader task reframes the stream on JPEG
//! SOI/EOI markers and pushes completed frames into a bounded hand-off
//! channel; a stderr drain escalates known failure lines; a watchdog restarts
//! the process when the stream stalls. Restarts are single-flight and each
//! reader generation carries its own cancellation token so an old reader can
//! never race a new one.

use crate::pool::FramePool;
use crate::ring::Frame;
use parking_lot::Mutex as SyncMutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const STALL_THRESHOLD: Duration = Duration::from_secs(30);
const RESTART_DELAY: Duration = Duration::from_secs(1);
const ERROR_BURST_BACKOFF: Duration = Duration::from_secs(10);
const ERROR_BURST_WINDOW: Duration = Duration::from_secs(60);
const ERROR_BURST_THRESHOLD: u64 = 5;
const ONE_SHOT_TIMEOUT: Duration = Duration::from_secs(15);

/// How a decoder failure is classified for health accounting and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ConnectionRefused,
    ConnectionTimeout,
    AuthFailed,
    StreamNotFound,
    Other,
}

impl FailureKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            FailureKind::ConnectionRefused => "connection_refused",
            FailureKind::ConnectionTimeout => "timeout",
            FailureKind::AuthFailed => "auth_failed",
            FailureKind::StreamNotFound => "stream_not_found",
            FailureKind::Other => "ffmpeg_error",
        }
    }
}

/// Classify a decoder stderr excerpt.
pub fn classify_failure(stderr: &str) -> FailureKind {
    if stderr.contains("Connection refused") {
        FailureKind::ConnectionRefused
    } else if stderr.contains("Connection timed out") || stderr.contains("timed out") {
        FailureKind::ConnectionTimeout
    } else if stderr.contains("401") || stderr.contains("Unauthorized") {
        FailureKind::AuthFailed
    } else if stderr.contains("404") || stderr.contains("Not Found") {
        FailureKind::StreamNotFound
    } else {
        FailureKind::Other
    }
}

/// Errors raised by decoder operations.
#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("failed to spawn decoder process: {0}")]
    Spawn(String),

    #[error("decoder failed ({}): {reason}", .kind.as_label())]
    Failed { kind: FailureKind, reason: String },

    #[error("decoder produced an empty frame")]
    EmptyFrame,

    #[error("capture cancelled")]
    Cancelled,
}

impl DecoderError {
    pub fn kind_label(&self) -> &'static str {
        match self {
            DecoderError::Spawn(_) => "spawn_failed",
            DecoderError::Failed { kind, .. } => kind.as_label(),
            DecoderError::EmptyFrame => "empty_frame",
            DecoderError::Cancelled => "cancelled",
        }
    }
}

/// Decoder invocation parameters for one camera.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub camera_id: String,
    pub url: String,
    /// JPEG quality (`-q:v`), lower is better.
    pub quality: u32,
    /// Forced output rate (`-vf fps=N`).
    pub fps: u32,
    /// Optional output size, e.g. "1280x720".
    pub resolution: String,
}

/// Supervisor statistics snapshot.
#[derive(Debug, Default, Clone)]
pub struct DecoderStats {
    pub frames_read: u64,
    pub frames_dropped_full: u64,
    pub restarts: u64,
}

struct ProcState {
    child: Option<Child>,
    generation: CancellationToken,
}

/// Owns one long-running decoder process and its reader tasks.
pub struct DecoderSupervisor {
    config: DecoderConfig,
    camera_id: Arc<str>,
    pool: Arc<FramePool>,

    handoff_tx: SyncMutex<Option<flume::Sender<Frame>>>,
    handoff_rx: flume::Receiver<Frame>,

    proc: Mutex<ProcState>,
    restarting: AtomicBool,
    cancel: CancellationToken,

    last_frame: SyncMutex<Instant>,
    last_restart: SyncMutex<Instant>,
    error_count: AtomicU64,
    frames_read: AtomicU64,
    frames_dropped_full: AtomicU64,
    restarts: AtomicU64,
}

impl DecoderSupervisor {
    pub fn new(
        config: DecoderConfig,
        handoff_capacity: usize,
        pool: Arc<FramePool>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = flume::bounded(handoff_capacity.max(1));
        let camera_id: Arc<str> = Arc::from(config.camera_id.as_str());

        Arc::new(Self {
            config,
            camera_id,
            pool,
            handoff_tx: SyncMutex::new(Some(tx)),
            handoff_rx: rx,
            proc: Mutex::new(ProcState {
                child: None,
                generation: CancellationToken::new(),
            }),
            restarting: AtomicBool::new(false),
            cancel: parent.child_token(),
            last_frame: SyncMutex::new(Instant::now()),
            last_restart: SyncMutex::new(Instant::now()),
            error_count: AtomicU64::new(0),
            frames_read: AtomicU64::new(0),
            frames_dropped_full: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        })
    }

    /// Spawn the decoder process and start the reader, stderr drain and
    /// stall watchdog.
    pub async fn start(self: &Arc<Self>) -> Result<(), DecoderError> {
        {
            let mut proc = self.proc.lock().await;
            self.spawn_into(&mut proc)?;
        }

        let watchdog = self.clone();
        tokio::spawn(async move { watchdog.watch_stalls().await });

        info!(
            camera_id = %self.camera_id,
            fps = self.config.fps,
            quality = self.config.quality,
            "persistent decoder started"
        );
        Ok(())
    }

    /// Pop the oldest buffered frame without waiting.
    pub fn try_get(&self) -> Option<Frame> {
        self.handoff_rx.try_recv().ok()
    }

    /// Wait up to `timeout` for a frame.
    pub async fn get_with_timeout(&self, timeout: Duration) -> Option<Frame> {
        tokio::time::timeout(timeout, self.handoff_rx.recv_async())
            .await
            .ok()
            .and_then(Result::ok)
    }

    /// Stop the process and every task; closes the hand-off channel.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let mut proc = self.proc.lock().await;
        proc.generation.cancel();
        if let Some(mut child) = proc.child.take() {
            let _ = child.kill().await;
        }
        self.handoff_tx.lock().take();

        info!(camera_id = %self.camera_id, "persistent decoder stopped");
    }

    /// Push a frame into the hand-off as the reader task would.
    #[cfg(test)]
    pub(crate) fn inject_frame(&self, frame: Frame) {
        let tx = self.handoff_tx.lock().clone();
        if let Some(tx) = tx {
            match tx.try_send(frame) {
                Ok(()) => {
                    self.frames_read.fetch_add(1, Ordering::Relaxed);
                    *self.last_frame.lock() = Instant::now();
                }
                Err(flume::TrySendError::Full(frame)) | Err(flume::TrySendError::Disconnected(frame)) => {
                    drop(frame);
                    self.frames_dropped_full.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_dropped_full: self.frames_dropped_full.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }

    /// Kill and respawn the decoder process. Concurrent calls collapse into
    /// one restart.
    pub async fn restart(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self
            .restarting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(camera_id = %self.camera_id, "restart already in progress");
            return;
        }

        let mut proc = self.proc.lock().await;

        // Stop the old reader generation before touching the process so it
        // can never observe the new one's pipes.
        proc.generation.cancel();
        if let Some(mut child) = proc.child.take() {
            let _ = child.kill().await;
        }

        tokio::time::sleep(RESTART_DELAY).await;

        match self.spawn_into(&mut proc) {
            Ok(()) => {
                self.error_count.store(0, Ordering::Release);
                *self.last_restart.lock() = Instant::now();
                *self.last_frame.lock() = Instant::now();
                self.restarts.fetch_add(1, Ordering::Relaxed);
                info!(camera_id = %self.camera_id, "decoder restarted");
            }
            Err(err) => {
                error!(camera_id = %self.camera_id, error = %err, "decoder restart failed");
            }
        }

        self.restarting.store(false, Ordering::Release);
    }

    fn spawn_into(self: &Arc<Self>, proc: &mut ProcState) -> Result<(), DecoderError> {
        let args = stream_args(
            &self.config.url,
            self.config.fps,
            self.config.quality,
            &self.config.resolution,
        );
        debug!(camera_id = %self.camera_id, ?args, "spawning decoder");

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DecoderError::Spawn(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DecoderError::Spawn("missing stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DecoderError::Spawn("missing stderr pipe".to_string()))?;

        let generation = self.cancel.child_token();
        proc.child = Some(child);
        proc.generation = generation.clone();

        let reader = self.clone();
        let reader_gen = generation.clone();
        tokio::spawn(async move { reader.read_frames(stdout, reader_gen).await });

        let drain = self.clone();
        tokio::spawn(async move { drain.drain_stderr(stderr, generation).await });

        Ok(())
    }

    /// Reframe the MJPEG byte stream on SOI/EOI markers.
    async fn read_frames(self: Arc<Self>, stdout: ChildStdout, generation: CancellationToken) {
        let mut reader = BufReader::with_capacity(1024 * 1024, stdout);
        let mut assembly: Vec<u8> = Vec::with_capacity(512 * 1024);

        loop {
            let byte = tokio::select! {
                _ = generation.cancelled() => return,
                byte = reader.read_u8() => byte,
            };

            let byte = match byte {
                Ok(byte) => byte,
                Err(err) => {
                    // A cancelled generation means a restart is already under
                    // way; exit quietly.
                    if generation.is_cancelled() {
                        return;
                    }
                    self.handle_stream_error(&err.to_string()).await;
                    return;
                }
            };

            assembly.push(byte);

            let len = assembly.len();
            if len >= 2 && assembly[len - 2..] == JPEG_EOI {
                if assembly.starts_with(&JPEG_SOI) {
                    // The assembly buffer is scratch; the frame gets its own
                    // buffer from the camera pool.
                    let mut data = self.pool.acquire(len);
                    data.copy_from_slice(&assembly);
                    let frame = Frame::new(self.camera_id.clone(), data, self.pool.clone());

                    self.frames_read.fetch_add(1, Ordering::Relaxed);
                    *self.last_frame.lock() = Instant::now();

                    let tx = self.handoff_tx.lock().clone();
                    match tx {
                        Some(tx) => match tx.try_send(frame) {
                            Ok(()) => {}
                            Err(flume::TrySendError::Full(frame)) => {
                                drop(frame);
                                self.frames_dropped_full.fetch_add(1, Ordering::Relaxed);
                                debug!(camera_id = %self.camera_id, "hand-off full, frame dropped");
                            }
                            Err(flume::TrySendError::Disconnected(frame)) => {
                                drop(frame);
                                return;
                            }
                        },
                        None => return,
                    }
                }
                assembly.clear();
            }
        }
    }

    async fn drain_stderr(self: Arc<Self>, stderr: ChildStderr, generation: CancellationToken) {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            let line = tokio::select! {
                _ = generation.cancelled() => return,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => match classify_failure(&line) {
                    FailureKind::ConnectionRefused | FailureKind::ConnectionTimeout => {
                        warn!(camera_id = %self.camera_id, message = %line, "decoder stderr");
                    }
                    FailureKind::AuthFailed | FailureKind::StreamNotFound => {
                        error!(camera_id = %self.camera_id, message = %line, "decoder stderr");
                    }
                    FailureKind::Other => {
                        debug!(camera_id = %self.camera_id, message = %line, "decoder stderr");
                    }
                },
                Ok(None) | Err(_) => return,
            }
        }
    }

    async fn handle_stream_error(self: &Arc<Self>, message: &str) {
        error!(camera_id = %self.camera_id, error = %message, "decoder stream error");

        let errors = self.error_count.fetch_add(1, Ordering::AcqRel) + 1;
        let recently_restarted = self.last_restart.lock().elapsed() < ERROR_BURST_WINDOW;
        if errors > ERROR_BURST_THRESHOLD && recently_restarted {
            warn!(
                camera_id = %self.camera_id,
                errors,
                "error burst, backing off before restart"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(ERROR_BURST_BACKOFF) => {}
            }
        }

        self.restart().await;
    }

    /// Restart the process when no frame has arrived for the stall
    /// threshold.
    async fn watch_stalls(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {}
            }

            let stalled = self.last_frame.lock().elapsed() > STALL_THRESHOLD;
            if stalled {
                warn!(
                    camera_id = %self.camera_id,
                    threshold_secs = STALL_THRESHOLD.as_secs(),
                    "no frames from decoder, restarting"
                );
                self.restart().await;
            }
        }
    }
}

/// Arguments for the persistent streaming invocation.
fn stream_args(url: &str, fps: u32, quality: u32, resolution: &str) -> Vec<String> {
    let lowered = url.to_ascii_lowercase();
    let mut args: Vec<String> = Vec::new();

    if lowered.starts_with("rtsp://") || lowered.starts_with("rtsps://") {
        args.extend(["-rtsp_transport", "tcp", "-timeout", "5000000"].map(String::from));
    } else if lowered.starts_with("rtmp://") || lowered.starts_with("rtmps://") {
        args.extend(["-rw_timeout", "5000000", "-listen", "0"].map(String::from));
    }

    args.extend(
        [
            "-fflags",
            "nobuffer+fastseek+flush_packets+discardcorrupt",
            "-flags",
            "low_delay",
            "-max_delay",
            "0",
            "-probesize",
            "32",
            "-analyzeduration",
            "0",
            "-err_detect",
            "ignore_err",
            "-i",
        ]
        .map(String::from),
    );
    args.push(url.to_string());

    let mut filter = format!("fps={fps}");
    if let Some((width, height)) = parse_resolution(resolution) {
        filter.push_str(&format!(",scale={width}:{height}"));
    }
    args.extend(["-vf".to_string(), filter]);

    args.extend(
        [
            "-f",
            "image2pipe",
            "-vcodec",
            "mjpeg",
            "-q:v",
        ]
        .map(String::from),
    );
    args.push(quality.to_string());
    args.extend(["-threads", "1", "-"].map(String::from));

    args
}

/// Arguments for the one-shot single-frame invocation.
fn one_shot_args(url: &str, quality: u32) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let lowered = url.to_ascii_lowercase();
    if lowered.starts_with("rtsp://") || lowered.starts_with("rtsps://") {
        args.extend(["-rtsp_transport", "tcp"].map(String::from));
    }
    args.push("-i".to_string());
    args.push(url.to_string());
    args.extend(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "mjpeg", "-q:v"].map(String::from));
    args.push(quality.to_string());
    args.push("-".to_string());
    args
}

fn parse_resolution(resolution: &str) -> Option<(u32, u32)> {
    let (width, height) = resolution.split_once('x')?;
    Some((width.parse().ok()?, height.parse().ok()?))
}

/// Last `max_chars` characters of a stderr dump, for log-sized excerpts.
fn tail_excerpt(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// Capture exactly one frame by running the decoder to completion.
pub async fn capture_one_shot(
    url: &str,
    quality: u32,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, DecoderError> {
    let args = one_shot_args(url, quality);

    let child = Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DecoderError::Spawn(e.to_string()))?;

    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(DecoderError::Cancelled),
        output = tokio::time::timeout(ONE_SHOT_TIMEOUT, child.wait_with_output()) => match output {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(DecoderError::Failed {
                    kind: FailureKind::Other,
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(DecoderError::Failed {
                    kind: FailureKind::ConnectionTimeout,
                    reason: "decoder did not finish in time".to_string(),
                })
            }
        },
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DecoderError::Failed {
            kind: classify_failure(&stderr),
            reason: tail_excerpt(&stderr, 300),
        });
    }

    if output.stdout.is_empty() {
        return Err(DecoderError::EmptyFrame);
    }

    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_failure("Connection refused"),
            FailureKind::ConnectionRefused
        );
        assert_eq!(
            classify_failure("Connection timed out"),
            FailureKind::ConnectionTimeout
        );
        assert_eq!(
            classify_failure("HTTP error 401 Unauthorized"),
            FailureKind::AuthFailed
        );
        assert_eq!(
            classify_failure("404 Not Found"),
            FailureKind::StreamNotFound
        );
        assert_eq!(
            classify_failure("mjpeg bitstream error"),
            FailureKind::Other
        );
    }

    #[test]
    fn test_stream_args_rtsp() {
        let args = stream_args("rtsp://cam:554/stream", 5, 4, "");
        assert_eq!(args[0], "-rtsp_transport");
        assert!(args.contains(&"fps=5".to_string()));
        assert!(args.contains(&"image2pipe".to_string()));
        assert!(args.contains(&"mjpeg".to_string()));
        assert!(!args.iter().any(|a| a.contains("scale")));
    }

    #[test]
    fn test_stream_args_rtmp_and_resolution() {
        let args = stream_args("rtmp://cam/live", 2, 5, "1280x720");
        assert_eq!(args[0], "-rw_timeout");
        assert!(args.contains(&"fps=2,scale=1280:720".to_string()));
    }

    #[test]
    fn test_one_shot_args() {
        let args = one_shot_args("rtsp://cam:554/stream", 5);
        assert!(args.contains(&"-frames:v".to_string()));
        assert!(args.contains(&"1".to_string()));
    }

    #[test]
    fn test_parse_resolution() {
        assert_eq!(parse_resolution("1920x1080"), Some((1920, 1080)));
        assert_eq!(parse_resolution(""), None);
        assert_eq!(parse_resolution("wide"), None);
    }

    #[tokio::test]
    async fn test_supervisor_handoff_drops_when_full() {
        let cancel = CancellationToken::new();
        let pool = Arc::new(FramePool::new(0));
        let supervisor = DecoderSupervisor::new(
            DecoderConfig {
                camera_id: "cam1".to_string(),
                url: "rtsp://example/stream".to_string(),
                quality: 5,
                fps: 2,
                resolution: String::new(),
            },
            2,
            pool.clone(),
            &cancel,
        );

        // Fill the hand-off directly through the sender the reader would use.
        let tx = supervisor.handoff_tx.lock().clone().unwrap();
        for i in 0..2u8 {
            let mut data = pool.acquire(4);
            data.fill(i);
            tx.try_send(Frame::new(Arc::from("cam1"), data, pool.clone()))
                .unwrap();
        }
        let mut data = pool.acquire(4);
        data.fill(9);
        assert!(tx
            .try_send(Frame::new(Arc::from("cam1"), data, pool.clone()))
            .is_err());

        // Frames drain in FIFO order.
        assert_eq!(supervisor.try_get().unwrap().data()[0], 0);
        assert_eq!(supervisor.try_get().unwrap().data()[0], 1);
        assert!(supervisor.try_get().is_none());
    }

    #[tokio::test]
    async fn test_stop_closes_handoff() {
        let cancel = CancellationToken::new();
        let pool = Arc::new(FramePool::new(0));
        let supervisor = DecoderSupervisor::new(
            DecoderConfig {
                camera_id: "cam1".to_string(),
                url: "rtsp://example/stream".to_string(),
                quality: 5,
                fps: 2,
                resolution: String::new(),
            },
            2,
            pool,
            &cancel,
        );

        supervisor.stop().await;
        assert!(supervisor.handoff_tx.lock().is_none());
        assert!(supervisor.try_get().is_none());
    }
}
