//! Startup announce to the fleet registration API.
//!
//! One POST on startup; on failure, retried every minute until it lands or
//! the process shuts down. Disabled deployments skip it entirely.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Camera entry in the announce payload.
#[derive(Debug, Clone, Serialize)]
pub struct CameraInfo {
    pub id: String,
    pub url: String,
}

/// The announce document.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationPayload {
    pub cameras: Vec<CameraInfo>,
    pub namespace: String,
    pub bus_url: String,
    pub routing_key: String,
    pub exchange: String,
    pub vhost: String,
}

/// Errors raised by a registration attempt.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration API URL is empty")]
    MissingUrl,

    #[error("registration request failed: {0}")]
    Request(String),

    #[error("registration rejected with status {0}")]
    Rejected(u16),
}

/// Announces this agent to the registration API.
pub struct RegistrationClient {
    api_url: String,
    enabled: bool,
    http: reqwest::Client,
}

impl RegistrationClient {
    pub fn new(api_url: impl Into<String>, enabled: bool) -> Self {
        Self {
            api_url: api_url.into(),
            enabled,
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// One announce attempt.
    pub async fn register(&self, payload: &RegistrationPayload) -> Result<(), RegistrationError> {
        if !self.enabled {
            return Ok(());
        }
        if self.api_url.is_empty() {
            return Err(RegistrationError::MissingUrl);
        }

        let response = self
            .http
            .post(&self.api_url)
            .json(payload)
            .send()
            .await
            .map_err(|e| RegistrationError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RegistrationError::Rejected(status.as_u16()));
        }

        info!(
            api_url = %self.api_url,
            vhost = %payload.vhost,
            cameras = payload.cameras.len(),
            "registered with the fleet API"
        );
        Ok(())
    }

    /// Announce now, and keep retrying every minute in the background until
    /// success or cancellation.
    pub fn register_with_retry(
        self: Arc<Self>,
        payload: RegistrationPayload,
        cancel: CancellationToken,
    ) {
        if !self.enabled {
            return;
        }

        tokio::spawn(async move {
            match self.register(&payload).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(error = %err, "registration failed, retrying every minute");
                }
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("registration retry stopped");
                        return;
                    }
                    _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                }

                match self.register(&payload).await {
                    Ok(()) => return,
                    Err(err) => {
                        warn!(error = %err, "registration retry failed");
                    }
                }
            }
        });
    }
}
