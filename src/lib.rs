//! edgesight - edge video ingestion agent.
//!
//! A per-tenant daemon that maintains persistent connections to a fixed set
//! of RTSP/RTMP cameras, decodes each stream into JPEG frames at a target
//! rate, and publishes frames plus derived metadata onto a topic-based
//! message bus, optionally mirroring frames into a short-TTL key/value
//! store.
//!
//! # Dataflow (per camera)
//!
//! ```text
//! decoder process -> JPEG reframer -> hand-off channel -> orchestrator
//!   (latest-frame flush) -> camera ring -> worker pool job
//!   -> { publisher, kv store, metadata emitter }
//! ```
//!
//! The circuit breaker wraps every capture attempt, the memory controller
//! gates the orchestrator loops, and the health monitor observes capture
//! outcomes.

pub mod amqp;
pub mod capture;
pub mod circuit;
pub mod compress;
pub mod config;
pub mod decoder;
pub mod keygen;
pub mod kv;
pub mod memory;
pub mod metadata;
pub mod metrics;
pub mod monitor;
pub mod mqtt;
pub mod pool;
pub mod publisher;
pub mod registration;
pub mod ring;
pub mod worker;

// Re-export main types
pub use amqp::AmqpPublisher;
pub use capture::{CameraPipeline, CameraPipelineParams, FrameJob};
pub use circuit::{BreakerState, CircuitBreaker, CircuitError};
pub use config::{AppConfig, CameraConfig, ConfigValidationError};
pub use decoder::{DecoderConfig, DecoderError, DecoderSupervisor, FailureKind};
pub use keygen::{KeyComponents, KeyGenerator, KeyGeneratorConfig, KeyStrategy};
pub use kv::{FrameStore, FrameStoreConfig, KvError};
pub use memory::{MemoryController, MemoryLevel, MemoryThresholds};
pub use metadata::{CameraState, MetadataEmitter, MetadataError};
pub use monitor::{CameraMonitor, CameraStatus};
pub use mqtt::MqttPublisher;
pub use pool::FramePool;
pub use publisher::{FramePublisher, PublishError, PublisherStats};
pub use registration::{RegistrationClient, RegistrationPayload};
pub use ring::{Frame, FrameRing, PushOutcome};
pub use worker::{Job, JobError, SubmitError, WorkerPool};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::capture::{CameraPipeline, CameraPipelineParams};
    pub use crate::config::AppConfig;
    pub use crate::publisher::{FramePublisher, PublishError};
    pub use crate::ring::Frame;
    pub use crate::worker::{Job, WorkerPool};
}
