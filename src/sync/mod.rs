//! # Device Sync Protocol
//!
//! One logical exchange with the backend: report the device token and ack
//! watermark, receive the oldest unacknowledged message (if any), and make it the
//! active message.
//!
//! ## Wire contract
//!
//! Request (`POST {endpoint}/device_request`):
//!
//! ```json
//! {"fcmId": "tok", "ackedUntilUtc": 1000, "causedByPushId": null, "deviceId": "3f2c..."}
//! ```
//!
//! Response:
//!
//! ```json
//! {"message": "hi", "date": 1000, "sender": "bob"}
//! ```
//!
//! A response carrying a `message` without both `date` and `sender` is malformed
//! and is discarded without touching local state.
//!
//! The sync client never retries on its own; the triggers (push, poll timer, ack)
//! fire again and that is the retry.

#[cfg(feature = "http")]
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::ArmedFlag;
use crate::logutil::escape_log;
use crate::state::{ActiveMessage, StateError, StateStore};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("backend transport error: {0}")]
    Transport(String),

    #[error("malformed backend response: {0}")]
    Malformed(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("sync task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub fcm_id: Option<String>,
    pub acked_until_utc: i64,
    pub caused_by_push_id: Option<i64>,
    pub device_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceResponse {
    #[serde(default)]
    pub message: Option<String>,
    /// Epoch millis the message was sent.
    #[serde(default)]
    pub date: Option<i64>,
    #[serde(default)]
    pub sender: Option<String>,
}

impl DeviceResponse {
    /// Interpret the response: `Ok(None)` when there is nothing to show,
    /// `Err(Malformed)` when a body arrives without its sender or date.
    pub fn into_message(self) -> Result<Option<ActiveMessage>, SyncError> {
        let body = match self.message {
            Some(body) if !body.is_empty() => body,
            _ => return Ok(None),
        };
        match (self.sender, self.date) {
            (Some(sender), Some(date)) => Ok(Some(ActiveMessage {
                sender,
                body,
                sent_at_utc: date,
            })),
            (sender, date) => Err(SyncError::Malformed(format!(
                "message without sender/date (sender={:?}, date={:?})",
                sender.as_deref().map(escape_log),
                date
            ))),
        }
    }
}

/// The authenticated backend endpoint.
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn device_request(&self, request: &DeviceRequest) -> Result<DeviceResponse, SyncError>;
}

/// What a `request_sync` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Not armed; nothing was sent.
    Disarmed,
    /// Backend has no pending message.
    NoMessage,
    /// A message was applied; `changed` is false when it was already active.
    Applied { changed: bool },
}

pub struct SyncClient {
    store: Arc<StateStore>,
    backend: Arc<dyn BackendApi>,
    armed: ArmedFlag,
}

impl SyncClient {
    pub fn new(store: Arc<StateStore>, backend: Arc<dyn BackendApi>, armed: ArmedFlag) -> Self {
        Self {
            store,
            backend,
            armed,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Build the request from current local state.
    pub fn build_request(&self, caused_by_push_id: Option<i64>) -> DeviceRequest {
        DeviceRequest {
            fcm_id: self.store.device_token(),
            acked_until_utc: self.store.acked_until_utc(),
            caused_by_push_id,
            device_id: self.store.device_id(),
        }
    }

    /// Perform one device-sync exchange and apply the response.
    pub async fn request_sync(&self, caused_by_push_id: Option<i64>) -> Result<SyncOutcome, SyncError> {
        if !self.armed.is_armed() {
            debug!("Not armed; skipping sync");
            return Ok(SyncOutcome::Disarmed);
        }

        let request = self.build_request(caused_by_push_id);
        debug!(
            "Sync request: acked_until_utc={} cause={:?} token={}",
            request.acked_until_utc,
            request.caused_by_push_id,
            request.fcm_id.is_some()
        );

        let response = match self.backend.device_request(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Device sync failed: {}", e);
                return Err(e);
            }
        };

        let message = match response.into_message() {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("No pending message");
                return Ok(SyncOutcome::NoMessage);
            }
            Err(e) => {
                error!("Discarding device response: {}", e);
                return Err(e);
            }
        };

        let change = self.store.set_active_message(Some(message)).await?;
        if change.is_change() {
            info!("New message applied from sync");
        }
        Ok(SyncOutcome::Applied {
            changed: change.is_change(),
        })
    }

    /// Run `request_sync` on its own task; the result stays observable through the
    /// handle.
    pub fn spawn_sync(self: &Arc<Self>, caused_by_push_id: Option<i64>) -> JoinHandle<Result<SyncOutcome, SyncError>> {
        let client = self.clone();
        tokio::spawn(async move { client.request_sync(caused_by_push_id).await })
    }
}
