//! edgesight daemon entry point.
//!
//! A single executable with optional first-arg verbs: `install`,
//! `uninstall`, `start`, `stop`, `console`, `version`. With no verb the
//! agent runs in the foreground until SIGINT/SIGTERM.

use edgesight::amqp::AmqpPublisher;
use edgesight::capture::{CameraPipeline, CameraPipelineParams};
use edgesight::circuit::CircuitBreaker;
use edgesight::compress::Compressor;
use edgesight::config::AppConfig;
use edgesight::decoder::{DecoderConfig, DecoderSupervisor};
use edgesight::kv::{FrameStore, FrameStoreConfig};
use edgesight::memory::{MemoryController, MemoryLevel, MemoryThresholds};
use edgesight::metadata::{CameraState, MetadataEmitter};
use edgesight::metrics::{self, METRICS};
use edgesight::monitor::CameraMonitor;
use edgesight::mqtt::MqttPublisher;
use edgesight::pool::FramePool;
use edgesight::publisher::FramePublisher;
use edgesight::registration::{CameraInfo, RegistrationClient, RegistrationPayload};
use edgesight::ring::FrameRing;
use edgesight::worker::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const METRICS_ADDR: &str = "0.0.0.0:9090";
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Buffers preallocated per camera pool.
const POOL_PREALLOC: usize = 10;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("install") | Some("uninstall") | Some("start") | Some("stop") => {
            println!(
                "service management is not available on this platform; \
                 run the binary under your init system instead"
            );
            Ok(())
        }
        Some("version") => {
            println!("edgesight v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some("console") | None => run(),
        Some(other) => {
            println!("unknown command: {other}");
            println!("usage: edgesight [install|uninstall|start|stop|console|version]");
            std::process::exit(2);
        }
    }
}

#[tokio::main]
async fn run_async(config: AppConfig) -> anyhow::Result<()> {
    let vhost = config.vhost();
    let root = CancellationToken::new();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        cameras = config.cameras.len(),
        target_fps = config.target_fps,
        protocol = %config.protocol,
        vhost = %vhost,
        max_workers = config.effective_max_workers(),
        worker_queue_size = config.effective_worker_queue_size(),
        camera_buffer_size = config.effective_camera_buffer_size(),
        persistent_buffer_size = config.effective_persistent_buffer_size(),
        "starting edge video agent"
    );

    // Metrics endpoint.
    {
        let cancel = root.clone();
        tokio::spawn(async move { metrics::serve(METRICS_ADDR, cancel).await });
    }

    // Memory controller.
    let memory = if config.memory.enabled {
        let controller = MemoryController::new(
            MemoryThresholds {
                max_memory_mb: config.memory.max_memory_mb,
                warning_percent: config.memory.warning_percent,
                critical_percent: config.memory.critical_percent,
                emergency_percent: config.memory.emergency_percent,
                check_interval: Duration::from_secs(config.memory.check_interval_seconds.max(1)),
                reclaim_trigger_percent: config.memory.gc_trigger_percent,
            },
            &root,
        );
        controller.register_callback(
            MemoryLevel::Critical,
            Arc::new(|snapshot| {
                warn!(
                    usage_percent = format!("{:.2}", snapshot.usage_percent),
                    alloc_mb = snapshot.alloc_mb,
                    "memory critical, capture will be throttled"
                );
            }),
        );
        controller.register_callback(
            MemoryLevel::Emergency,
            Arc::new(|snapshot| {
                error!(
                    usage_percent = format!("{:.2}", snapshot.usage_percent),
                    alloc_mb = snapshot.alloc_mb,
                    "memory emergency, capture paused"
                );
            }),
        );
        controller.start();
        Some(controller)
    } else {
        None
    };

    // Fleet registration.
    let registration = Arc::new(RegistrationClient::new(
        config.registration.api_url.clone(),
        config.registration.enabled,
    ));
    registration.clone().register_with_retry(
        RegistrationPayload {
            cameras: config
                .cameras
                .iter()
                .map(|camera| CameraInfo {
                    id: camera.id.clone(),
                    url: camera.url.clone(),
                })
                .collect(),
            namespace: vhost.clone(),
            bus_url: config.amqp.amqp_url.clone(),
            routing_key: config.amqp.routing_key_prefix.clone(),
            exchange: config.amqp.exchange.clone(),
            vhost: vhost.clone(),
        },
        root.clone(),
    );

    // Shared worker pool.
    let workers = WorkerPool::new(
        config.effective_max_workers(),
        config.effective_worker_queue_size(),
        &root,
    );

    // Metadata bus handle: AMQP only, on its own exchange.
    let metadata = if config.protocol == "amqp" && config.metadata.enabled {
        let bus = AmqpPublisher::connect(
            config.amqp.amqp_url.clone(),
            config.metadata.exchange.clone(),
            config.metadata.routing_key.clone(),
            0,
            &root,
        )
        .await?;
        Arc::new(MetadataEmitter::new(
            Some(Arc::new(bus)),
            config.metadata.routing_key.clone(),
            true,
        ))
    } else {
        Arc::new(MetadataEmitter::disabled())
    };

    // Frame store.
    let compressor = if config.compression.enabled {
        Some(Compressor::new(config.compression.level)?)
    } else {
        None
    };
    let store = Arc::new(FrameStore::new(
        FrameStoreConfig {
            enabled: config.redis.enabled,
            address: config.redis.address.clone(),
            username: config.redis.username.clone(),
            password: config.redis.password.clone(),
            ttl: Duration::from_secs(config.redis.ttl_seconds.max(1)),
            prefix: config.redis.prefix.clone(),
            vhost: vhost.clone(),
        },
        compressor,
    ));
    if store.enabled() {
        info!(
            vhost = %vhost,
            prefix = %config.redis.prefix,
            ttl_seconds = config.redis.ttl_seconds,
            "frame store enabled"
        );
    }

    // Camera health monitor, with status events on the metadata channel.
    let monitor = CameraMonitor::new(Duration::from_secs(30), &root);
    install_monitor_callbacks(&monitor, &metadata);
    monitor.start();

    // MQTT deployments share one publisher; AMQP gets one per camera with a
    // fully resolved routing key.
    let shared_mqtt: Option<Arc<dyn FramePublisher>> = if config.protocol == "mqtt" {
        Some(Arc::new(MqttPublisher::new(
            &config.mqtt.broker,
            config.mqtt.topic_prefix.clone(),
            &root,
        )?))
    } else {
        None
    };

    let mut pipelines: Vec<Arc<CameraPipeline>> = Vec::with_capacity(config.cameras.len());
    let mut publishers: Vec<Arc<dyn FramePublisher>> = Vec::new();
    if let Some(publisher) = &shared_mqtt {
        publishers.push(publisher.clone());
    }

    for camera in &config.cameras {
        monitor.register_camera(&camera.id);

        let (publisher, publisher_type): (Arc<dyn FramePublisher>, &'static str) =
            match &shared_mqtt {
                Some(publisher) => (publisher.clone(), "mqtt"),
                None => {
                    let routing_key =
                        format!("{}{}", config.amqp.routing_key_prefix, camera.id);
                    let publisher = Arc::new(
                        AmqpPublisher::connect(
                            config.amqp.amqp_url.clone(),
                            config.amqp.exchange.clone(),
                            routing_key,
                            0,
                            &root,
                        )
                        .await?,
                    );
                    publishers.push(publisher.clone());
                    (publisher, "amqp")
                }
            };

        let pool = Arc::new(FramePool::new(POOL_PREALLOC));
        if let Some(memory) = &memory {
            let reclaim_pool = pool.clone();
            memory.register_reclaimer(Arc::new(move || reclaim_pool.trim()));
        }

        let decoder = if config.optimization.use_persistent {
            Some(DecoderSupervisor::new(
                DecoderConfig {
                    camera_id: camera.id.clone(),
                    url: camera.url.clone(),
                    quality: config.optimization.frame_quality,
                    fps: config.decoder_fps(),
                    resolution: config.optimization.frame_resolution.clone(),
                },
                config.effective_persistent_buffer_size(),
                pool.clone(),
                &root,
            ))
        } else {
            None
        };

        let pipeline = CameraPipeline::new(
            CameraPipelineParams {
                camera_id: camera.id.clone(),
                camera_name: camera.name.clone(),
                url: camera.url.clone(),
                interval: config.frame_interval(),
                use_persistent: config.optimization.use_persistent,
                quality: config.optimization.frame_quality,
                pool,
                ring: Arc::new(FrameRing::new(config.effective_camera_buffer_size())),
                workers: workers.clone(),
                publisher,
                publisher_type,
                store: store.clone(),
                metadata: metadata.clone(),
                monitor: monitor.clone(),
                memory: memory.clone(),
                breaker: Arc::new(CircuitBreaker::new(
                    camera.id.clone(),
                    config.circuit_max_failures(),
                    config.circuit_reset_timeout(),
                )),
                decoder,
            },
            &root,
        );

        pipeline.start().await?;
        pipelines.push(pipeline);
    }

    // Periodic stats logging.
    {
        let workers = workers.clone();
        let monitor = monitor.clone();
        let cancel = root.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(STATS_LOG_INTERVAL) => {}
                }
                let stats = workers.stats();
                METRICS
                    .worker_pool_queue_size
                    .with_label_values(&["main"])
                    .set(stats.queue_size as i64);
                METRICS
                    .worker_pool_processing
                    .with_label_values(&["main"])
                    .set(stats.processing as i64);
                info!(
                    queue = stats.queue_size,
                    capacity = stats.capacity,
                    processing = stats.processing,
                    processed = stats.total_processed,
                    errors = stats.total_errors,
                    active_cameras = monitor.active_count(),
                    "system stats"
                );
            }
        });
    }

    // Wait for a termination signal.
    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping");

    root.cancel();
    tokio::time::sleep(SHUTDOWN_DRAIN).await;

    for pipeline in &pipelines {
        pipeline.stop().await;
    }
    workers.shutdown().await;
    for publisher in &publishers {
        publisher.close().await;
    }

    info!("edge video agent stopped");
    Ok(())
}

fn run() -> anyhow::Result<()> {
    let config = AppConfig::load().map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;
    init_logging(&config)?;
    if let Err(err) = config.validate() {
        error!(error = %err, "invalid configuration");
        return Err(err.into());
    }
    run_async(config)
}

fn init_logging(config: &AppConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}

/// Wire camera up/down and all-inactive transitions to metadata status
/// events. Callbacks hold only a weak reference to the monitor so the
/// registry and its callbacks can never keep each other alive.
fn install_monitor_callbacks(monitor: &Arc<CameraMonitor>, metadata: &Arc<MetadataEmitter>) {
    if !metadata.enabled() {
        return;
    }

    let weak_up = Arc::downgrade(monitor);
    let metadata_up = metadata.clone();
    let on_up: Arc<dyn Fn(String) + Send + Sync> = Arc::new(move |camera_id: String| {
        let Some(_monitor) = weak_up.upgrade() else {
            return;
        };
        info!(camera_id = %camera_id, "camera is active again");
        let metadata = metadata_up.clone();
        tokio::spawn(async move {
            if let Err(err) = metadata
                .emit_camera_status(
                    &camera_id,
                    CameraState::Active,
                    0,
                    None,
                    "camera reconnected and operating normally",
                )
                .await
            {
                warn!(error = %err, "failed to emit camera-up status");
            }
        });
    });

    let weak_down = Arc::downgrade(monitor);
    let metadata_down = metadata.clone();
    let on_down: Arc<dyn Fn(String) + Send + Sync> = Arc::new(move |camera_id: String| {
        let Some(monitor) = weak_down.upgrade() else {
            return;
        };
        let status = monitor.status(&camera_id);
        let metadata = metadata_down.clone();
        tokio::spawn(async move {
            let (failures, last_error) = status
                .map(|s| (s.consecutive_failures, s.last_error))
                .unwrap_or((0, None));
            if let Err(err) = metadata
                .emit_camera_status(
                    &camera_id,
                    CameraState::Inactive,
                    failures,
                    last_error.as_deref(),
                    "camera became inactive after repeated failures",
                )
                .await
            {
                warn!(error = %err, "failed to emit camera-down status");
            }
        });
    });

    let weak_alarm = Arc::downgrade(monitor);
    let metadata_alarm = metadata.clone();
    let on_all_inactive: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
        let Some(monitor) = weak_alarm.upgrade() else {
            return;
        };
        let total = monitor.total_count();
        let active = monitor.active_count();
        error!(
            total_cameras = total,
            "no active cameras, the agent is effectively blind"
        );
        let metadata = metadata_alarm.clone();
        tokio::spawn(async move {
            if let Err(err) = metadata
                .emit_system_status(
                    total,
                    active,
                    total - active,
                    "no active cameras detected",
                )
                .await
            {
                warn!(error = %err, "failed to emit system status");
            }
        });
    });

    monitor.set_callbacks(Some(on_up), Some(on_down), Some(on_all_inactive));
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
