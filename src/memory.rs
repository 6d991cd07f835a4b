//! Process-wide memory pressure tracking and capture throttling.
//!
//! A background tick samples process memory, maps usage onto a pressure
//! level and tells orchestrators to slow down or pause. Reclaim hooks (one
//! per camera buffer pool) release pooled memory when pressure rises.

use crate::metrics::METRICS;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECLAIM_DEBOUNCE: Duration = Duration::from_secs(5);
const EMERGENCY_SECOND_PASS_DELAY: Duration = Duration::from_millis(100);
const AUTO_SIZE_FRACTION: f64 = 0.75;
const AUTO_SIZE_FLOOR_MB: u64 = 512;

/// Memory pressure, ordered from calm to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryLevel {
    Normal,
    Warning,
    Critical,
    Emergency,
}

impl MemoryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryLevel::Normal => "normal",
            MemoryLevel::Warning => "warning",
            MemoryLevel::Critical => "critical",
            MemoryLevel::Emergency => "emergency",
        }
    }

    pub fn as_gauge(&self) -> i64 {
        match self {
            MemoryLevel::Normal => 0,
            MemoryLevel::Warning => 1,
            MemoryLevel::Critical => 2,
            MemoryLevel::Emergency => 3,
        }
    }

    /// Capture delay applied at this level; monotone non-decreasing.
    pub fn throttle_delay(&self) -> Duration {
        match self {
            MemoryLevel::Normal => Duration::ZERO,
            MemoryLevel::Warning => Duration::from_millis(100),
            MemoryLevel::Critical => Duration::from_millis(500),
            MemoryLevel::Emergency => Duration::from_secs(2),
        }
    }
}

/// Controller thresholds, resolved from the `[memory]` config section.
#[derive(Debug, Clone)]
pub struct MemoryThresholds {
    pub max_memory_mb: u64,
    pub warning_percent: f64,
    pub critical_percent: f64,
    pub emergency_percent: f64,
    pub check_interval: Duration,
    pub reclaim_trigger_percent: f64,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            max_memory_mb: 0,
            warning_percent: 60.0,
            critical_percent: 75.0,
            emergency_percent: 85.0,
            check_interval: Duration::from_secs(2),
            reclaim_trigger_percent: 70.0,
        }
    }
}

/// One memory sample with its derived level.
#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    pub alloc_mb: u64,
    pub max_mb: u64,
    pub usage_percent: f64,
    pub level: MemoryLevel,
    pub sampled_at: Instant,
}

#[derive(Debug, Clone)]
struct ThrottleState {
    current_delay: Duration,
    paused: bool,
    last_update: Instant,
}

type LevelCallback = Arc<dyn Fn(MemorySnapshot) + Send + Sync>;
type Reclaimer = Arc<dyn Fn() -> usize + Send + Sync>;

/// Tracks process memory against a ceiling and issues throttle and pause
/// directives to the capture loops.
pub struct MemoryController {
    thresholds: RwLock<MemoryThresholds>,
    level: RwLock<MemoryLevel>,
    snapshot: RwLock<Option<MemorySnapshot>>,
    last_reclaim: Mutex<Instant>,
    callbacks: RwLock<Vec<(MemoryLevel, LevelCallback)>>,
    reclaimers: RwLock<Vec<Reclaimer>>,
    throttle_map: Mutex<HashMap<String, ThrottleState>>,
    system: Mutex<System>,
    pid: Pid,
    cancel: CancellationToken,
}

impl MemoryController {
    pub fn new(mut thresholds: MemoryThresholds, parent: &CancellationToken) -> Arc<Self> {
        let mut system = System::new();
        if thresholds.max_memory_mb == 0 {
            system.refresh_memory();
            let total_mb = system.total_memory() / 1024 / 1024;
            thresholds.max_memory_mb =
                ((total_mb as f64 * AUTO_SIZE_FRACTION) as u64).max(AUTO_SIZE_FLOOR_MB);
        }

        info!(
            max_memory_mb = thresholds.max_memory_mb,
            warning_percent = thresholds.warning_percent,
            critical_percent = thresholds.critical_percent,
            emergency_percent = thresholds.emergency_percent,
            "memory controller initialized"
        );

        Arc::new(Self {
            thresholds: RwLock::new(thresholds),
            level: RwLock::new(MemoryLevel::Normal),
            snapshot: RwLock::new(None),
            last_reclaim: Mutex::new(Instant::now()),
            callbacks: RwLock::new(Vec::new()),
            reclaimers: RwLock::new(Vec::new()),
            throttle_map: Mutex::new(HashMap::new()),
            system: Mutex::new(system),
            pid: Pid::from_u32(std::process::id()),
            cancel: parent.child_token(),
        })
    }

    /// Register a callback fired when the controller enters `level`.
    pub fn register_callback(&self, level: MemoryLevel, callback: LevelCallback) {
        self.callbacks.write().push((level, callback));
    }

    /// Register a hook that frees pooled memory and reports how many buffers
    /// it released.
    pub fn register_reclaimer(&self, reclaimer: Reclaimer) {
        self.reclaimers.write().push(reclaimer);
    }

    pub fn level(&self) -> MemoryLevel {
        *self.level.read()
    }

    pub fn snapshot(&self) -> Option<MemorySnapshot> {
        self.snapshot.read().clone()
    }

    pub fn should_throttle(&self) -> bool {
        self.level() >= MemoryLevel::Critical
    }

    pub fn should_pause(&self) -> bool {
        self.level() >= MemoryLevel::Emergency
    }

    /// Delay the given camera should apply before (or instead of) its next
    /// capture tick.
    pub fn throttle_delay(&self, camera_id: &str) -> Duration {
        let level = self.level();
        let delay = level.throttle_delay();

        let mut map = self.throttle_map.lock();
        let state = map
            .entry(camera_id.to_string())
            .or_insert_with(|| ThrottleState {
                current_delay: Duration::ZERO,
                paused: false,
                last_update: Instant::now(),
            });
        state.current_delay = delay;
        state.paused = level >= MemoryLevel::Emergency;
        state.last_update = Instant::now();

        delay
    }

    /// Start the sampling tick.
    pub fn start(self: &Arc<Self>) {
        let controller = self.clone();
        tokio::spawn(async move {
            let interval = controller.thresholds.read().check_interval;
            loop {
                tokio::select! {
                    _ = controller.cancel.cancelled() => {
                        info!("memory controller stopped");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
                controller.tick().await;
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Force the current level without sampling.
    #[cfg(test)]
    pub(crate) fn force_level(&self, level: MemoryLevel) {
        *self.level.write() = level;
    }

    async fn tick(self: &Arc<Self>) {
        let snapshot = self.sample();

        METRICS.memory_usage_percent.set(snapshot.usage_percent);
        METRICS.memory_alloc_mb.set(snapshot.alloc_mb as f64);
        METRICS.memory_level.set(snapshot.level.as_gauge());

        let old_level = {
            let mut level = self.level.write();
            let old = *level;
            *level = snapshot.level;
            old
        };
        *self.snapshot.write() = Some(snapshot.clone());

        if snapshot.level != old_level {
            warn!(
                old_level = old_level.as_str(),
                new_level = snapshot.level.as_str(),
                usage_percent = format!("{:.2}", snapshot.usage_percent),
                alloc_mb = snapshot.alloc_mb,
                "memory level changed"
            );
            self.fire_callbacks(&snapshot);
        }

        match snapshot.level {
            MemoryLevel::Normal => {}
            MemoryLevel::Warning => {
                let trigger = self.thresholds.read().reclaim_trigger_percent;
                if snapshot.usage_percent >= trigger && self.reclaim_due() {
                    self.reclaim("warning level");
                }
            }
            MemoryLevel::Critical => {
                self.reclaim("critical level");
            }
            MemoryLevel::Emergency => {
                self.reclaim("emergency level");
                tokio::time::sleep(EMERGENCY_SECOND_PASS_DELAY).await;
                self.reclaim("emergency second pass");
            }
        }
    }

    fn sample(&self) -> MemorySnapshot {
        let thresholds = self.thresholds.read().clone();
        let alloc_mb = {
            let mut system = self.system.lock();
            system.refresh_processes_specifics(ProcessRefreshKind::new().with_memory());
            system
                .process(self.pid)
                .map(|p| p.memory() / 1024 / 1024)
                .unwrap_or(0)
        };

        let usage_percent = if thresholds.max_memory_mb > 0 {
            alloc_mb as f64 / thresholds.max_memory_mb as f64 * 100.0
        } else {
            0.0
        };

        MemorySnapshot {
            alloc_mb,
            max_mb: thresholds.max_memory_mb,
            usage_percent,
            level: determine_level(usage_percent, &thresholds),
            sampled_at: Instant::now(),
        }
    }

    fn fire_callbacks(&self, snapshot: &MemorySnapshot) {
        let callbacks: Vec<LevelCallback> = self
            .callbacks
            .read()
            .iter()
            .filter(|(level, _)| *level == snapshot.level)
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in callbacks {
            let snapshot = snapshot.clone();
            tokio::spawn(async move { callback(snapshot) });
        }
    }

    fn reclaim_due(&self) -> bool {
        self.last_reclaim.lock().elapsed() >= RECLAIM_DEBOUNCE
    }

    fn reclaim(&self, reason: &str) {
        *self.last_reclaim.lock() = Instant::now();
        let reclaimers: Vec<Reclaimer> = self.reclaimers.read().clone();

        let mut released = 0usize;
        for reclaimer in reclaimers {
            released += reclaimer();
        }
        debug!(reason, released, "reclaimed pooled buffers");
    }
}

fn determine_level(usage_percent: f64, thresholds: &MemoryThresholds) -> MemoryLevel {
    if usage_percent >= thresholds.emergency_percent {
        MemoryLevel::Emergency
    } else if usage_percent >= thresholds.critical_percent {
        MemoryLevel::Critical
    } else if usage_percent >= thresholds.warning_percent {
        MemoryLevel::Warning
    } else {
        MemoryLevel::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn create_controller() -> Arc<MemoryController> {
        let cancel = CancellationToken::new();
        MemoryController::new(
            MemoryThresholds {
                max_memory_mb: 1000,
                ..Default::default()
            },
            &cancel,
        )
    }

    fn force_level(controller: &MemoryController, level: MemoryLevel) {
        controller.force_level(level);
    }

    #[test]
    fn test_determine_level_thresholds() {
        let thresholds = MemoryThresholds::default();
        assert_eq!(determine_level(10.0, &thresholds), MemoryLevel::Normal);
        assert_eq!(determine_level(60.0, &thresholds), MemoryLevel::Warning);
        assert_eq!(determine_level(74.9, &thresholds), MemoryLevel::Warning);
        assert_eq!(determine_level(75.0, &thresholds), MemoryLevel::Critical);
        assert_eq!(determine_level(85.0, &thresholds), MemoryLevel::Emergency);
        assert_eq!(determine_level(90.0, &thresholds), MemoryLevel::Emergency);
    }

    #[test]
    fn test_throttle_delay_monotone_with_level() {
        let levels = [
            MemoryLevel::Normal,
            MemoryLevel::Warning,
            MemoryLevel::Critical,
            MemoryLevel::Emergency,
        ];
        for window in levels.windows(2) {
            assert!(window[0].throttle_delay() <= window[1].throttle_delay());
        }
        assert_eq!(MemoryLevel::Normal.throttle_delay(), Duration::ZERO);
        assert_eq!(
            MemoryLevel::Emergency.throttle_delay(),
            Duration::from_secs(2)
        );
    }

    #[tokio::test]
    async fn test_directives_follow_level() {
        let controller = create_controller();

        assert!(!controller.should_throttle());
        assert!(!controller.should_pause());

        force_level(&controller, MemoryLevel::Critical);
        assert!(controller.should_throttle());
        assert!(!controller.should_pause());
        assert_eq!(
            controller.throttle_delay("cam1"),
            Duration::from_millis(500)
        );

        force_level(&controller, MemoryLevel::Emergency);
        assert!(controller.should_pause());
        assert_eq!(controller.throttle_delay("cam1"), Duration::from_secs(2));

        force_level(&controller, MemoryLevel::Normal);
        assert_eq!(controller.throttle_delay("cam1"), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_reclaimers_invoked() {
        let controller = create_controller();
        let released = Arc::new(AtomicUsize::new(0));
        let released_hook = released.clone();
        controller.register_reclaimer(Arc::new(move || {
            released_hook.fetch_add(3, Ordering::SeqCst);
            3
        }));

        controller.reclaim("test");
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_reclaim_debounce() {
        let controller = create_controller();
        // A reclaim just happened at construction time baseline.
        *controller.last_reclaim.lock() = Instant::now();
        assert!(!controller.reclaim_due());
        *controller.last_reclaim.lock() = Instant::now() - Duration::from_secs(6);
        assert!(controller.reclaim_due());
    }

    #[test]
    fn test_auto_size_floor() {
        let cancel = CancellationToken::new();
        let controller = MemoryController::new(
            MemoryThresholds {
                max_memory_mb: 0,
                ..Default::default()
            },
            &cancel,
        );
        assert!(controller.thresholds.read().max_memory_mb >= AUTO_SIZE_FLOOR_MB);
    }
}
