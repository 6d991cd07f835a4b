//! AMQP publisher with serialized writes, publisher confirms and
//! auto-reconnect.
//!
//! One publisher is constructed per camera with a fixed exchange and a fully
//! resolved routing key. The underlying channel is not safe for concurrent
//! writers, so every publish holds a single send lock for the duration of one
//! emit. Confirms are consumed by a dedicated reader task scoped to the
//! connection generation: reconnecting cancels and joins the old reader
//! before a new one is spawned.

use crate::config::extract_vhost;
use crate::publisher::{FramePublisher, PublishError, PublisherStats};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use lapin::options::{
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reconnect delay ladder, clamped at the last step.
const RECONNECT_LADDER: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// One connection generation: channel, its confirm reader and the token that
/// stops the reader when the generation ends.
struct Generation {
    channel: Channel,
    connection: Connection,
    confirm_tx: mpsc::UnboundedSender<lapin::publisher_confirm::PublisherConfirm>,
    confirm_task: JoinHandle<()>,
    token: CancellationToken,
}

struct Shared {
    url: String,
    exchange: String,
    routing_key: String,
    prefetch_count: u16,

    // Send lock: held for the duration of one emit. Also guards the live
    // generation.
    generation: Mutex<Option<Generation>>,

    connected: AtomicBool,
    reconnecting: AtomicBool,
    published: AtomicU64,
    publish_errors: AtomicU64,
    acks: Arc<AtomicU64>,
    nacks: Arc<AtomicU64>,

    reconnect_kick: tokio::sync::Notify,
    cancel: CancellationToken,
}

/// AMQP publisher bound to one exchange and routing key.
pub struct AmqpPublisher {
    shared: Arc<Shared>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpPublisher {
    /// Connect and start the reconnect watcher. The initial connection is
    /// retried with exponential backoff before giving up.
    pub async fn connect(
        url: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        prefetch_count: u16,
        parent: &CancellationToken,
    ) -> Result<Self, PublishError> {
        let shared = Arc::new(Shared {
            url: url.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            prefetch_count,
            generation: Mutex::new(None),
            connected: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            published: AtomicU64::new(0),
            publish_errors: AtomicU64::new(0),
            acks: Arc::new(AtomicU64::new(0)),
            nacks: Arc::new(AtomicU64::new(0)),
            reconnect_kick: tokio::sync::Notify::new(),
            cancel: parent.child_token(),
        });

        let initial = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Some(Duration::from_secs(120)),
            ..Default::default()
        };
        backoff::future::retry(initial, || async {
            establish(&shared).await.map_err(|err| {
                warn!(error = %err, "broker connection attempt failed, retrying");
                backoff::Error::transient(err)
            })
        })
        .await?;

        info!(
            exchange = %shared.exchange,
            routing_key = %shared.routing_key,
            vhost = %extract_vhost(&shared.url),
            "connected to the message broker"
        );

        let watcher = tokio::spawn(reconnect_watcher(shared.clone()));

        Ok(Self {
            shared,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub fn exchange(&self) -> &str {
        &self.shared.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.shared.routing_key
    }

    /// Publish a payload on an explicit routing key with an explicit content
    /// type. Used by the metadata emitter, which derives side routing keys
    /// from its base key. Subject to the same send serialization as frame
    /// publishes.
    pub async fn publish_raw(
        &self,
        routing_key: &str,
        payload: &[u8],
        content_type: &str,
        headers: Option<FieldTable>,
    ) -> Result<(), PublishError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(content_type))
            .with_delivery_mode(1)
            .with_timestamp(Utc::now().timestamp() as u64);
        let properties = match headers {
            Some(headers) => properties.with_headers(headers),
            None => properties,
        };
        self.emit(routing_key, payload, properties).await
    }

    async fn emit(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), PublishError> {
        let shared = &self.shared;

        if !shared.connected.load(Ordering::Acquire) {
            shared.publish_errors.fetch_add(1, Ordering::Relaxed);
            return Err(PublishError::Disconnected);
        }

        // The send lock serializes every emit on the shared channel.
        let mut guard = shared.generation.lock().await;
        let Some(generation) = guard.as_mut() else {
            shared.publish_errors.fetch_add(1, Ordering::Relaxed);
            return Err(PublishError::Disconnected);
        };

        // The broker library may retain the payload beyond this call, so it
        // gets a copy, never the pipeline's buffer.
        let payload_copy = payload.to_vec();

        let result = generation
            .channel
            .basic_publish(
                &shared.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload_copy,
                properties,
            )
            .await;

        match result {
            Ok(confirm) => {
                // Hand the pending confirmation to the reader task; acks and
                // nacks are tallied in broker order.
                let _ = generation.confirm_tx.send(confirm);
                shared.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                drop(guard);
                shared.publish_errors.fetch_add(1, Ordering::Relaxed);
                shared.connected.store(false, Ordering::Release);
                shared.reconnect_kick.notify_one();
                Err(PublishError::Failed(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl FramePublisher for AmqpPublisher {
    async fn publish(
        &self,
        camera_id: &str,
        payload: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<(), PublishError> {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("camera_id"),
            AMQPValue::LongString(camera_id.into()),
        );

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/octet-stream"))
            .with_delivery_mode(1)
            .with_timestamp(timestamp.timestamp() as u64)
            .with_headers(headers);

        let routing_key = self.shared.routing_key.clone();
        self.emit(&routing_key, payload, properties).await
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.shared.published.load(Ordering::Relaxed),
            publish_errors: self.shared.publish_errors.load(Ordering::Relaxed),
            acks: self.shared.acks.load(Ordering::Relaxed),
            nacks: self.shared.nacks.load(Ordering::Relaxed),
        }
    }

    async fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.connected.store(false, Ordering::Release);

        if let Some(watcher) = self.watcher.lock().await.take() {
            let _ = watcher.await;
        }

        let mut guard = self.shared.generation.lock().await;
        if let Some(generation) = guard.take() {
            teardown(generation).await;
        }
        info!(exchange = %self.shared.exchange, "publisher closed");
    }
}

/// Dial, open a channel, declare the exchange, apply QoS, enable confirms
/// and spawn this generation's confirm reader.
async fn establish(shared: &Arc<Shared>) -> Result<(), PublishError> {
    let connection = Connection::connect(&shared.url, ConnectionProperties::default())
        .await
        .map_err(|e| PublishError::Failed(format!("connect: {e}")))?;

    // Any connection-level error flips the publisher to disconnected and
    // wakes the reconnect watcher.
    let error_shared = shared.clone();
    connection.on_error(move |err| {
        warn!(error = %err, "broker connection error");
        error_shared.connected.store(false, Ordering::Release);
        error_shared.reconnect_kick.notify_one();
    });

    let channel = connection
        .create_channel()
        .await
        .map_err(|e| PublishError::Failed(format!("open channel: {e}")))?;

    channel
        .exchange_declare(
            &shared.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| PublishError::Failed(format!("declare exchange: {e}")))?;

    // Bound the number of unconfirmed frames in flight (0 = unlimited).
    channel
        .basic_qos(shared.prefetch_count, BasicQosOptions::default())
        .await
        .map_err(|e| PublishError::Failed(format!("set qos: {e}")))?;

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| PublishError::Failed(format!("enable confirms: {e}")))?;

    let token = shared.cancel.child_token();
    let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
    let confirm_task = tokio::spawn(confirm_reader(
        confirm_rx,
        shared.acks.clone(),
        shared.nacks.clone(),
        token.clone(),
    ));

    let mut guard = shared.generation.lock().await;
    *guard = Some(Generation {
        channel,
        connection,
        confirm_tx,
        confirm_task,
        token,
    });
    shared.connected.store(true, Ordering::Release);

    debug!(
        exchange = %shared.exchange,
        prefetch = shared.prefetch_count,
        "qos applied and publisher confirms enabled"
    );
    Ok(())
}

/// Consume pending confirmations in publish order, tallying acks and nacks.
/// Exactly one reader is live per connection generation.
async fn confirm_reader(
    mut rx: mpsc::UnboundedReceiver<lapin::publisher_confirm::PublisherConfirm>,
    acks: Arc<AtomicU64>,
    nacks: Arc<AtomicU64>,
    token: CancellationToken,
) {
    loop {
        let confirm = tokio::select! {
            _ = token.cancelled() => break,
            confirm = rx.recv() => match confirm {
                Some(confirm) => confirm,
                None => break,
            },
        };

        match confirm.await {
            Ok(Confirmation::Ack(_)) | Ok(Confirmation::NotRequested) => {
                acks.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Confirmation::Nack(_)) => {
                nacks.fetch_add(1, Ordering::Relaxed);
                warn!("frame rejected by the broker (nack)");
            }
            Err(err) => {
                debug!(error = %err, "confirmation lost");
            }
        }
    }
    debug!("confirm reader stopped");
}

/// Cancel the generation's confirm reader, wait for it to finish, then close
/// the channel and connection. The old reader is always gone before a new
/// generation is established.
async fn teardown(generation: Generation) {
    generation.token.cancel();
    let _ = generation.confirm_task.await;
    let _ = generation.channel.close(200, "reconnect").await;
    let _ = generation.connection.close(200, "reconnect").await;
}

/// Watches for connection loss and reconnects with the delay ladder. The
/// `reconnecting` flag makes re-entry a no-op.
async fn reconnect_watcher(shared: Arc<Shared>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = shared.reconnect_kick.notified() => {}
        }

        if shared.connected.load(Ordering::Acquire) {
            continue;
        }
        if shared
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            continue;
        }

        let mut step = 0usize;
        loop {
            if shared.cancel.is_cancelled() {
                break;
            }

            // Retire the previous generation before dialing again.
            let old = shared.generation.lock().await.take();
            if let Some(generation) = old {
                teardown(generation).await;
            }

            info!("reconnecting to the message broker");
            match establish(&shared).await {
                Ok(()) => {
                    info!("reconnected to the message broker");
                    break;
                }
                Err(err) => {
                    let delay = RECONNECT_LADDER[step.min(RECONNECT_LADDER.len() - 1)];
                    step += 1;
                    warn!(error = %err, delay_secs = delay.as_secs(), "reconnect failed");
                    tokio::select! {
                        _ = shared.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        shared.reconnecting.store(false, Ordering::Release);
    }
}
