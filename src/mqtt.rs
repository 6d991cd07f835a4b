//! MQTT publisher backend.
//!
//! Frames are published to `topic_prefix + camera_id` at QoS 1. The rumqttc
//! event loop handles reconnection internally; the driver task tracks
//! connection state from its events.

use crate::publisher::{FramePublisher, PublishError, PublisherStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors raised while setting up the MQTT connection.
#[derive(Debug, Error)]
pub enum MqttSetupError {
    #[error("invalid broker address {0:?}, expected host:port")]
    InvalidBroker(String),
}

struct Shared {
    connected: AtomicBool,
    published: AtomicU64,
    publish_errors: AtomicU64,
    acks: AtomicU64,
}

/// MQTT publisher over a shared client; topics are derived per publish.
pub struct MqttPublisher {
    client: AsyncClient,
    topic_prefix: String,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl MqttPublisher {
    pub fn new(
        broker: &str,
        topic_prefix: impl Into<String>,
        parent: &CancellationToken,
    ) -> Result<Self, MqttSetupError> {
        let (host, port) = parse_broker(broker)?;

        let client_id = format!("edgesight-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(15));
        options.set_clean_session(true);

        let (client, mut event_loop) = AsyncClient::new(options, 64);

        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            published: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
            acks: AtomicU64::new(0),
        });
        let cancel = parent.child_token();

        // The event loop must be polled for the client to make progress; it
        // also reconnects on its own after errors.
        let driver_shared = shared.clone();
        let driver_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = driver_cancel.cancelled() => break,
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("connected to the mqtt broker");
                            driver_shared.connected.store(true, Ordering::Release);
                        }
                        Ok(Event::Incoming(Incoming::PubAck(_))) => {
                            driver_shared.acks.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            if driver_shared.connected.swap(false, Ordering::AcqRel) {
                                warn!(error = %err, "mqtt connection lost, retrying");
                            }
                            tokio::select! {
                                _ = driver_cancel.cancelled() => break,
                                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            }
                        }
                    }
                }
            }
            debug!("mqtt event loop stopped");
        });

        Ok(Self {
            client,
            topic_prefix: topic_prefix.into(),
            shared,
            cancel,
        })
    }
}

fn parse_broker(broker: &str) -> Result<(String, u16), MqttSetupError> {
    let trimmed = broker
        .trim_start_matches("mqtt://")
        .trim_start_matches("tcp://");
    match trimmed.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port: u16 = port
                .parse()
                .map_err(|_| MqttSetupError::InvalidBroker(broker.to_string()))?;
            Ok((host.to_string(), port))
        }
        _ if !trimmed.is_empty() => Ok((trimmed.to_string(), 1883)),
        _ => Err(MqttSetupError::InvalidBroker(broker.to_string())),
    }
}

#[async_trait]
impl FramePublisher for MqttPublisher {
    async fn publish(
        &self,
        camera_id: &str,
        payload: &[u8],
        _timestamp: DateTime<Utc>,
    ) -> Result<(), PublishError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            self.shared.publish_errors.fetch_add(1, Ordering::Relaxed);
            return Err(PublishError::Disconnected);
        }

        let topic = format!("{}{}", self.topic_prefix, camera_id);
        // The client queues the message internally, so it gets its own copy
        // of the payload.
        match self
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
        {
            Ok(()) => {
                self.shared.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.shared.publish_errors.fetch_add(1, Ordering::Relaxed);
                Err(PublishError::Failed(err.to_string()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.shared.published.load(Ordering::Relaxed),
            publish_errors: self.shared.publish_errors.load(Ordering::Relaxed),
            acks: self.shared.acks.load(Ordering::Relaxed),
            nacks: 0,
        }
    }

    async fn close(&self) {
        let _ = self.client.disconnect().await;
        self.cancel.cancel();
        info!("mqtt publisher closed");
    }
}
