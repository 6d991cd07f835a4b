//! Camera health registry and up/down transitions.
//!
//! Orchestrators report capture outcomes here. Three consecutive failures
//! deactivate a camera; any success reactivates it. Callbacks are dispatched
//! on separate tasks so reporting never blocks, and they must not call back
//! into the monitor's lock.

use crate::metrics::METRICS;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEACTIVATION_THRESHOLD: u32 = 3;
const SILENT_CAMERA_THRESHOLD: Duration = Duration::from_secs(300);

/// Health record for one registered camera.
#[derive(Debug, Clone)]
pub struct CameraStatus {
    pub camera_id: String,
    pub is_active: bool,
    pub last_success: Option<Instant>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

type CameraCallback = Arc<dyn Fn(String) + Send + Sync>;
type AlarmCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_camera_up: Option<CameraCallback>,
    on_camera_down: Option<CameraCallback>,
    on_all_inactive: Option<AlarmCallback>,
}

/// Central registry of per-camera health.
pub struct CameraMonitor {
    cameras: RwLock<HashMap<String, CameraStatus>>,
    callbacks: RwLock<Callbacks>,
    sweep_interval: Duration,
    cancel: CancellationToken,
}

impl CameraMonitor {
    pub fn new(sweep_interval: Duration, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            cameras: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Callbacks::default()),
            sweep_interval,
            cancel: parent.child_token(),
        })
    }

    /// Install transition callbacks. Each runs on its own task.
    pub fn set_callbacks(
        &self,
        on_camera_up: Option<CameraCallback>,
        on_camera_down: Option<CameraCallback>,
        on_all_inactive: Option<AlarmCallback>,
    ) {
        let mut callbacks = self.callbacks.write();
        callbacks.on_camera_up = on_camera_up;
        callbacks.on_camera_down = on_camera_down;
        callbacks.on_all_inactive = on_all_inactive;
    }

    pub fn register_camera(&self, camera_id: &str) {
        self.cameras.write().insert(
            camera_id.to_string(),
            CameraStatus {
                camera_id: camera_id.to_string(),
                is_active: false,
                last_success: None,
                consecutive_failures: 0,
                last_error: None,
            },
        );
        info!(camera_id, "camera registered with health monitor");
    }

    pub fn record_success(&self, camera_id: &str) {
        let was_inactive;
        {
            let mut cameras = self.cameras.write();
            let Some(status) = cameras.get_mut(camera_id) else {
                return;
            };
            was_inactive = !status.is_active;
            status.is_active = true;
            status.last_success = Some(Instant::now());
            status.consecutive_failures = 0;
            status.last_error = None;
        }

        METRICS
            .camera_connected
            .with_label_values(&[camera_id])
            .set(1);
        METRICS
            .last_successful_capture
            .with_label_values(&[camera_id])
            .set(chrono::Utc::now().timestamp());
        self.update_active_count();

        if was_inactive {
            let callback = self.callbacks.read().on_camera_up.clone();
            if let Some(callback) = callback {
                let camera_id = camera_id.to_string();
                tokio::spawn(async move { callback(camera_id) });
            }
        }
    }

    pub fn record_failure(&self, camera_id: &str, error: &str) {
        let went_down;
        let all_inactive_now;
        let failures;
        {
            let mut cameras = self.cameras.write();
            let Some(status) = cameras.get_mut(camera_id) else {
                return;
            };

            status.consecutive_failures += 1;
            status.last_error = Some(error.to_string());
            failures = status.consecutive_failures;

            let was_active = status.is_active;
            if status.consecutive_failures >= DEACTIVATION_THRESHOLD {
                status.is_active = false;
            }
            went_down = was_active && !status.is_active;

            // The alarm fires once, on the transition that deactivated the
            // last active camera.
            all_inactive_now = went_down && cameras.values().all(|s| !s.is_active);
        }

        debug!(camera_id, failures, error, "capture failure recorded");

        if went_down {
            METRICS
                .camera_connected
                .with_label_values(&[camera_id])
                .set(0);
            self.update_active_count();

            warn!(camera_id, failures, "camera became inactive");
            let callback = self.callbacks.read().on_camera_down.clone();
            if let Some(callback) = callback {
                let camera_id = camera_id.to_string();
                tokio::spawn(async move { callback(camera_id) });
            }
        }

        if all_inactive_now {
            let callback = self.callbacks.read().on_all_inactive.clone();
            if let Some(callback) = callback {
                tokio::spawn(async move { callback() });
            }
        }
    }

    pub fn status(&self, camera_id: &str) -> Option<CameraStatus> {
        self.cameras.read().get(camera_id).cloned()
    }

    pub fn all_statuses(&self) -> Vec<CameraStatus> {
        self.cameras.read().values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.cameras.read().values().filter(|s| s.is_active).count()
    }

    pub fn total_count(&self) -> usize {
        self.cameras.read().len()
    }

    /// Start the background sweep that flags nominally active cameras with
    /// no recent captures.
    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => {
                        info!("camera health monitor stopped");
                        return;
                    }
                    _ = tokio::time::sleep(monitor.sweep_interval) => {}
                }
                monitor.sweep();
            }
        });
    }

    fn sweep(&self) {
        let statuses = self.all_statuses();
        let mut active = 0usize;
        let mut inactive = 0usize;

        for status in &statuses {
            if status.is_active {
                active += 1;
                let silent = status
                    .last_success
                    .map(|t| t.elapsed() > SILENT_CAMERA_THRESHOLD)
                    .unwrap_or(false);
                if silent {
                    warn!(
                        camera_id = %status.camera_id,
                        "camera is nominally active but has produced no frames recently"
                    );
                }
            } else {
                inactive += 1;
            }
        }

        if !statuses.is_empty() {
            if active == 0 {
                warn!(total = statuses.len(), "no active cameras");
            } else if inactive > 0 {
                warn!(active, inactive, "some cameras are inactive");
            }
        }
        debug!(active, inactive, total = statuses.len(), "camera sweep");
    }

    fn update_active_count(&self) {
        METRICS.active_cameras_count.set(self.active_count() as i64);
    }
}
