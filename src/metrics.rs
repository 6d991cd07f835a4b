//! Prometheus metrics and the scrape endpoint.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// All pipeline metrics, registered on a dedicated registry.
pub struct Metrics {
    pub registry: Registry,

    pub frames_processed: IntCounterVec,
    pub frames_dropped: IntCounterVec,
    pub capture_latency: HistogramVec,
    pub worker_pool_queue_size: IntGaugeVec,
    pub worker_pool_processing: IntGaugeVec,
    pub buffer_size: IntGaugeVec,
    pub circuit_breaker_state: IntGaugeVec,
    pub camera_connected: IntGaugeVec,
    pub publish_latency: HistogramVec,
    pub storage_operations: IntCounterVec,
    pub frame_size_bytes: HistogramVec,
    pub memory_usage_percent: prometheus::Gauge,
    pub memory_alloc_mb: prometheus::Gauge,
    pub memory_level: IntGauge,
    pub camera_throttled: IntCounterVec,
    pub camera_paused: IntCounterVec,
    pub active_cameras_count: IntGauge,
    pub last_successful_capture: IntGaugeVec,
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let vec = IntCounterVec::new(prometheus::Opts::new(name, help), labels)
        .expect("valid metric definition");
    registry
        .register(Box::new(vec.clone()))
        .expect("unique metric name");
    vec
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    let vec =
        IntGaugeVec::new(prometheus::Opts::new(name, help), labels).expect("valid metric definition");
    registry
        .register(Box::new(vec.clone()))
        .expect("unique metric name");
    vec
}

fn histogram_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let vec = HistogramVec::new(
        prometheus::HistogramOpts::new(name, help).buckets(buckets),
        labels,
    )
    .expect("valid metric definition");
    registry
        .register(Box::new(vec.clone()))
        .expect("unique metric name");
    vec
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let latency_buckets = vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
        ];
        let publish_buckets = vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];
        let size_buckets = vec![
            1024.0, 5120.0, 10240.0, 51200.0, 102400.0, 512000.0, 1048576.0,
        ];

        let memory_usage_percent = prometheus::Gauge::new(
            "memory_usage_percent",
            "Process memory usage as a percentage of the configured maximum",
        )
        .expect("valid metric definition");
        let memory_alloc_mb =
            prometheus::Gauge::new("memory_alloc_mb", "Process allocated memory in MiB")
                .expect("valid metric definition");
        let memory_level = IntGauge::new(
            "memory_level",
            "Memory pressure level (0=normal, 1=warning, 2=critical, 3=emergency)",
        )
        .expect("valid metric definition");
        let active_cameras_count =
            IntGauge::new("active_cameras_count", "Number of currently active cameras")
                .expect("valid metric definition");
        registry
            .register(Box::new(memory_usage_percent.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(memory_alloc_mb.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(memory_level.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(active_cameras_count.clone()))
            .expect("unique metric name");

        Self {
            frames_processed: counter_vec(
                &registry,
                "frames_processed_total",
                "Frames fully processed per camera",
                &["camera_id"],
            ),
            frames_dropped: counter_vec(
                &registry,
                "frames_dropped_total",
                "Frames dropped per camera and reason",
                &["camera_id", "reason"],
            ),
            capture_latency: histogram_vec(
                &registry,
                "capture_latency_seconds",
                "Latency from capture to delivery",
                &["camera_id"],
                latency_buckets,
            ),
            worker_pool_queue_size: gauge_vec(
                &registry,
                "worker_pool_queue_size",
                "Jobs waiting in the worker pool queue",
                &["pool"],
            ),
            worker_pool_processing: gauge_vec(
                &registry,
                "worker_pool_processing",
                "Jobs currently being processed",
                &["pool"],
            ),
            buffer_size: gauge_vec(
                &registry,
                "buffer_size",
                "Frames currently held in the camera ring",
                &["camera_id"],
            ),
            circuit_breaker_state: gauge_vec(
                &registry,
                "circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
                &["name"],
            ),
            camera_connected: gauge_vec(
                &registry,
                "camera_connected",
                "Camera connection status (0=down, 1=up)",
                &["camera_id"],
            ),
            publish_latency: histogram_vec(
                &registry,
                "publish_latency_seconds",
                "Bus publish latency",
                &["publisher_type"],
                publish_buckets,
            ),
            storage_operations: counter_vec(
                &registry,
                "storage_operations_total",
                "Key/value store operations by outcome",
                &["operation", "status"],
            ),
            frame_size_bytes: histogram_vec(
                &registry,
                "frame_size_bytes",
                "Captured frame sizes",
                &["camera_id"],
                size_buckets,
            ),
            memory_usage_percent,
            memory_alloc_mb,
            memory_level,
            camera_throttled: counter_vec(
                &registry,
                "camera_throttled_total",
                "Capture ticks delayed by memory pressure",
                &["camera_id"],
            ),
            camera_paused: counter_vec(
                &registry,
                "camera_paused_total",
                "Capture ticks paused by memory pressure",
                &["camera_id"],
            ),
            active_cameras_count,
            last_successful_capture: gauge_vec(
                &registry,
                "last_successful_capture",
                "Unix timestamp of the last successful capture",
                &["camera_id"],
            ),
            registry,
        }
    }
}

/// Process-wide metrics handle.
pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

async fn render_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = METRICS.registry.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&families, &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer).into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()).into_response()
        }
    }
}

/// Serve `/metrics` until the token is cancelled.
pub async fn serve(addr: &str, cancel: CancellationToken) {
    let app = Router::new().route("/metrics", get(render_metrics));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr, error = %err, "failed to bind metrics endpoint");
            return;
        }
    };
    info!(addr, "metrics endpoint listening");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
    {
        error!(error = %err, "metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_gathers_after_touch() {
        METRICS
            .frames_processed
            .with_label_values(&["cam-test"])
            .inc();
        METRICS
            .frames_dropped
            .with_label_values(&["cam-test", "flushed_old_frames"])
            .inc_by(3);
        METRICS.memory_level.set(2);

        let families = METRICS.registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.iter().any(|n| n == "frames_processed_total"));
        assert!(names.iter().any(|n| n == "frames_dropped_total"));
        assert!(names.iter().any(|n| n == "memory_level"));
    }

    #[tokio::test]
    async fn test_render_produces_text_exposition() {
        METRICS
            .frames_processed
            .with_label_values(&["cam-render"])
            .inc();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&METRICS.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("frames_processed_total"));
    }
}
