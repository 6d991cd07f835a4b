//! The bus publication seam.
//!
//! The pipeline publishes through this trait so the AMQP and MQTT backends
//! are interchangeable and tests can record instead of sending.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by a publish attempt.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Not connected to the broker. The caller may retry a later frame;
    /// reconnection runs in the background.
    #[error("not connected to the message broker")]
    Disconnected,

    /// The broker or transport rejected the publication.
    #[error("publish failed: {0}")]
    Failed(String),
}

/// Publisher statistics snapshot.
#[derive(Debug, Default, Clone)]
pub struct PublisherStats {
    pub published: u64,
    pub publish_errors: u64,
    pub acks: u64,
    pub nacks: u64,
}

/// Best-effort frame publication onto the message bus.
#[async_trait]
pub trait FramePublisher: Send + Sync {
    /// Publish one frame payload. Returns once the broker has accepted the
    /// submission; delivery confirmation is asynchronous and tracked in
    /// [`PublisherStats`].
    async fn publish(
        &self,
        camera_id: &str,
        payload: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<(), PublishError>;

    fn is_connected(&self) -> bool;

    fn stats(&self) -> PublisherStats;

    async fn close(&self);
}

#[cfg(test)]
pub mod mock {
    //! Recording publisher for pipeline tests.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Debug, Clone)]
    pub struct RecordedPublish {
        pub camera_id: String,
        pub payload: Vec<u8>,
        pub timestamp: DateTime<Utc>,
    }

    #[derive(Default)]
    pub struct MockPublisher {
        pub published: Mutex<Vec<RecordedPublish>>,
        connected: AtomicBool,
        fail_next: AtomicBool,
        errors: AtomicU64,
    }

    impl MockPublisher {
        pub fn new() -> Self {
            let mock = Self::default();
            mock.connected.store(true, Ordering::SeqCst);
            mock
        }

        pub fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        pub fn fail_next(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }

        pub fn publish_count(&self) -> usize {
            self.published.lock().len()
        }
    }

    #[async_trait]
    impl FramePublisher for MockPublisher {
        async fn publish(
            &self,
            camera_id: &str,
            payload: &[u8],
            timestamp: DateTime<Utc>,
        ) -> Result<(), PublishError> {
            if !self.connected.load(Ordering::SeqCst) {
                self.errors.fetch_add(1, Ordering::SeqCst);
                return Err(PublishError::Disconnected);
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                self.errors.fetch_add(1, Ordering::SeqCst);
                return Err(PublishError::Failed("injected".to_string()));
            }
            self.published.lock().push(RecordedPublish {
                camera_id: camera_id.to_string(),
                payload: payload.to_vec(),
                timestamp,
            });
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn stats(&self) -> PublisherStats {
            PublisherStats {
                published: self.published.lock().len() as u64,
                publish_errors: self.errors.load(Ordering::SeqCst),
                acks: 0,
                nacks: 0,
            }
        }

        async fn close(&self) {}
    }
}
