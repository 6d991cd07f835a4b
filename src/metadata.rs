//! Side-channel metadata events.
//!
//! Three JSON envelopes ride on routing keys derived from a configured base
//! key: frame metadata on the base key itself, camera status on
//! `base + ".status"`, system status on `base + ".system"`. When disabled
//! every emit is a no-op returning `Ok`.

use crate::amqp::AmqpPublisher;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors raised while emitting metadata. Never allowed to block the frame
/// pipeline; callers count and continue.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to serialize metadata event: {0}")]
    Serialize(String),

    #[error("failed to publish metadata event: {0}")]
    Publish(String),
}

/// Reported camera lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraState {
    Active,
    Inactive,
    Offline,
}

#[derive(Debug, Serialize)]
struct FrameEvent<'a> {
    event_type: &'static str,
    camera_id: &'a str,
    timestamp: DateTime<Utc>,
    redis_key: &'a str,
    width: u32,
    height: u32,
    encoding: &'a str,
    size_bytes: usize,
}

#[derive(Debug, Serialize)]
struct CameraStatusEvent<'a> {
    event_type: &'static str,
    camera_id: &'a str,
    timestamp: DateTime<Utc>,
    state: CameraState,
    consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<&'a str>,
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct SystemStatusEvent<'a> {
    event_type: &'static str,
    timestamp: DateTime<Utc>,
    total_cameras: usize,
    active_cameras: usize,
    inactive_cameras: usize,
    message: &'a str,
}

/// Publishes metadata events through the bus, on its own exchange.
pub struct MetadataEmitter {
    enabled: bool,
    base_key: String,
    bus: Option<Arc<AmqpPublisher>>,
}

impl MetadataEmitter {
    pub fn new(bus: Option<Arc<AmqpPublisher>>, base_key: impl Into<String>, enabled: bool) -> Self {
        Self {
            enabled: enabled && bus.is_some(),
            base_key: base_key.into(),
            bus,
        }
    }

    /// Disabled emitter whose operations all succeed as no-ops.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            base_key: String::new(),
            bus: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Emit frame metadata after the corresponding frame publish.
    pub async fn emit_frame(
        &self,
        camera_id: &str,
        timestamp: DateTime<Utc>,
        redis_key: &str,
        width: u32,
        height: u32,
        size_bytes: usize,
        encoding: &str,
    ) -> Result<(), MetadataError> {
        if !self.enabled {
            return Ok(());
        }

        let event = FrameEvent {
            event_type: "frame",
            camera_id,
            timestamp,
            redis_key,
            width,
            height,
            encoding,
            size_bytes,
        };
        self.emit(&self.base_key, &event).await
    }

    pub async fn emit_camera_status(
        &self,
        camera_id: &str,
        state: CameraState,
        consecutive_failures: u32,
        last_error: Option<&str>,
        message: &str,
    ) -> Result<(), MetadataError> {
        if !self.enabled {
            return Ok(());
        }

        let event = CameraStatusEvent {
            event_type: "camera_status",
            camera_id,
            timestamp: Utc::now(),
            state,
            consecutive_failures,
            last_error,
            message,
        };
        let routing_key = format!("{}.status", self.base_key);
        self.emit(&routing_key, &event).await
    }

    pub async fn emit_system_status(
        &self,
        total_cameras: usize,
        active_cameras: usize,
        inactive_cameras: usize,
        message: &str,
    ) -> Result<(), MetadataError> {
        if !self.enabled {
            return Ok(());
        }

        let event = SystemStatusEvent {
            event_type: "system_status",
            timestamp: Utc::now(),
            total_cameras,
            active_cameras,
            inactive_cameras,
            message,
        };
        let routing_key = format!("{}.system", self.base_key);
        self.emit(&routing_key, &event).await
    }

    async fn emit<T: Serialize>(&self, routing_key: &str, event: &T) -> Result<(), MetadataError> {
        let bus = match &self.bus {
            Some(bus) => bus,
            None => return Ok(()),
        };

        let body = serde_json::to_vec(event).map_err(|e| MetadataError::Serialize(e.to_string()))?;

        bus.publish_raw(routing_key, &body, "application/json", None)
            .await
            .map_err(|e| MetadataError::Publish(e.to_string()))?;

        debug!(routing_key, size = body.len(), "metadata event emitted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_emitter_is_noop() {
        let emitter = MetadataEmitter::disabled();
        assert!(!emitter.enabled());
        assert!(emitter
            .emit_frame("cam1", Utc::now(), "key", 1280, 720, 42, "jpeg")
            .await
            .is_ok());
        assert!(emitter
            .emit_camera_status("cam1", CameraState::Inactive, 3, Some("timeout"), "down")
            .await
            .is_ok());
        assert!(emitter.emit_system_status(2, 0, 2, "all down").await.is_ok());
    }

    #[test]
    fn test_frame_event_shape() {
        let event = FrameEvent {
            event_type: "frame",
            camera_id: "cam1",
            timestamp: Utc::now(),
            redis_key: "tenant:frames:cam1:1:00001",
            width: 1280,
            height: 720,
            encoding: "jpeg",
            size_bytes: 1234,
        };
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "frame");
        assert_eq!(value["camera_id"], "cam1");
        assert_eq!(value["redis_key"], "tenant:frames:cam1:1:00001");
        assert_eq!(value["width"], 1280);
        assert_eq!(value["height"], 720);
        assert_eq!(value["size_bytes"], 1234);
    }

    #[test]
    fn test_camera_status_event_shape() {
        let event = CameraStatusEvent {
            event_type: "camera_status",
            camera_id: "cam2",
            timestamp: Utc::now(),
            state: CameraState::Inactive,
            consecutive_failures: 3,
            last_error: None,
            message: "camera became inactive after repeated failures",
        };
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["state"], "inactive");
        assert_eq!(value["consecutive_failures"], 3);
        assert!(value.get("last_error").is_none());
    }

    #[test]
    fn test_system_status_event_shape() {
        let event = SystemStatusEvent {
            event_type: "system_status",
            timestamp: Utc::now(),
            total_cameras: 2,
            active_cameras: 0,
            inactive_cameras: 2,
            message: "no active cameras",
        };
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "system_status");
        assert_eq!(value["active_cameras"], 0);
        assert_eq!(value["inactive_cameras"], 2);
    }
}
