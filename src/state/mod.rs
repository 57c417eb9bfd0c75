//! # Local State Store
//!
//! Durable home of everything the notifier remembers between runs:
//!
//! - the push-messaging device token,
//! - the acknowledgement watermark (epoch millis of the newest acknowledged message),
//! - the single active (displayed, unacknowledged) message,
//! - the stable device id sent with every sync request.
//!
//! Reads are served from an in-memory snapshot and never touch the backend. Every
//! mutation is written to the backend first and only then reflected in the snapshot,
//! so a failed write leaves both at their previous value.
//!
//! Active-message mutations and acknowledgements share one async mutex, which keeps
//! a push-triggered sync and a device dismiss from interleaving. When the effective
//! active message changes, registered [`MessageListener`]s are called while that
//! mutex is still held, so they observe changes in mutation order.
//!
//! ```rust,no_run
//! use pinotify::state::{ActiveMessage, StateStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = StateStore::open_sled("./data/state", None)?;
//!     store
//!         .set_active_message(Some(ActiveMessage::new("bob", "hi", 1000)))
//!         .await?;
//!     let acked = store.acknowledge_active().await?;
//!     assert!(acked.is_some());
//!     assert_eq!(store.acked_until_utc(), 1000);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod errors;

use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::logutil::escape_log;
pub use backend::{MemoryBackend, SledBackend, StateBackend};
pub use errors::StateError;

/// Watermark value before anything has been acknowledged.
pub const ACK_UNSET: i64 = -1;

const KEY_DEVICE_TOKEN: &str = "device_token";
const KEY_ACKED_UNTIL: &str = "acked_until_utc";
const KEY_ACTIVE_MESSAGE: &str = "active_message";
const KEY_DEVICE_ID: &str = "device_id";

/// The message currently shown to the user and not yet acknowledged.
///
/// Two messages are the same message when sender, body and send time all match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveMessage {
    pub sender: String,
    pub body: String,
    /// Epoch millis at which the backend recorded the message.
    pub sent_at_utc: i64,
}

impl ActiveMessage {
    pub fn new(sender: impl Into<String>, body: impl Into<String>, sent_at_utc: i64) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
            sent_at_utc,
        }
    }
}

/// Observer of active-message changes (the UI surface, the blink trigger).
///
/// Called synchronously from inside the store's mutation path; implementations must
/// return quickly and push any slow work onto a task.
pub trait MessageListener: Send + Sync {
    fn message_changed(&self, message: Option<&ActiveMessage>);
}

/// Effect of a `set_active_message` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageChange {
    /// New value equals the stored one; nothing written, nobody notified.
    Unchanged,
    /// A (different) message is now active.
    Replaced,
    /// The active slot was emptied.
    Cleared,
}

impl MessageChange {
    pub fn is_change(self) -> bool {
        !matches!(self, MessageChange::Unchanged)
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    device_token: Option<String>,
    acked_until_utc: i64,
    active: Option<ActiveMessage>,
    device_id: String,
}

pub struct StateStore {
    backend: Box<dyn StateBackend>,
    snapshot: RwLock<Snapshot>,
    mutation: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn MessageListener>>>,
}

impl StateStore {
    /// Open the store on top of `backend`, loading persisted values.
    ///
    /// `device_id` overrides the stored id; without it a persisted id is reused or a
    /// fresh one is generated and persisted.
    pub fn open<B>(backend: B, device_id: Option<String>) -> Result<Self, StateError>
    where
        B: StateBackend + 'static,
    {
        let device_token = decode::<String>(backend.load(KEY_DEVICE_TOKEN)?)?;
        let acked_until_utc = decode::<i64>(backend.load(KEY_ACKED_UNTIL)?)?.unwrap_or(ACK_UNSET);
        let active = decode::<ActiveMessage>(backend.load(KEY_ACTIVE_MESSAGE)?)?;
        let device_id = match device_id {
            Some(id) => id,
            None => match decode::<String>(backend.load(KEY_DEVICE_ID)?)? {
                Some(id) => id,
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    backend.store(KEY_DEVICE_ID, &bincode::serialize(&id)?)?;
                    info!("Generated device id {}", id);
                    id
                }
            },
        };
        debug!(
            "State loaded: token={} acked_until_utc={} active={}",
            device_token.is_some(),
            acked_until_utc,
            active.is_some()
        );
        Ok(Self {
            backend: Box::new(backend),
            snapshot: RwLock::new(Snapshot {
                device_token,
                acked_until_utc,
                active,
                device_id,
            }),
            mutation: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Open (or create) a sled-backed store rooted at `path`.
    pub fn open_sled<P: AsRef<Path>>(path: P, device_id: Option<String>) -> Result<Self, StateError> {
        Self::open(SledBackend::open(path)?, device_id)
    }

    /// Register an observer of active-message changes.
    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(listener);
    }

    pub fn device_id(&self) -> String {
        self.read().device_id.clone()
    }

    pub fn device_token(&self) -> Option<String> {
        self.read().device_token.clone()
    }

    pub fn acked_until_utc(&self) -> i64 {
        self.read().acked_until_utc
    }

    pub fn active_message(&self) -> Option<ActiveMessage> {
        self.read().active.clone()
    }

    /// Replace the device token; the most recent write wins.
    pub async fn set_device_token(&self, token: &str) -> Result<(), StateError> {
        let _guard = self.mutation.lock().await;
        self.backend
            .store(KEY_DEVICE_TOKEN, &bincode::serialize(token)?)?;
        self.write().device_token = Some(token.to_string());
        debug!("Device token updated");
        Ok(())
    }

    /// Raise the watermark to `sent_at_utc`. Returns `false` (and writes nothing) when
    /// that would not move the watermark forward.
    pub async fn advance_watermark(&self, sent_at_utc: i64) -> Result<bool, StateError> {
        let _guard = self.mutation.lock().await;
        self.advance_watermark_locked(sent_at_utc)
    }

    /// The single entry point for changing the active message.
    ///
    /// A message sent at or before the ack watermark was already acknowledged and
    /// is dropped as `Unchanged`.
    pub async fn set_active_message(
        &self,
        message: Option<ActiveMessage>,
    ) -> Result<MessageChange, StateError> {
        let _guard = self.mutation.lock().await;
        self.replace_active_locked(message)
    }

    /// Acknowledge the active message: persist its send time as the watermark, then
    /// clear the slot. Returns the acknowledged message, or `None` if nothing was
    /// active.
    pub async fn acknowledge_active(&self) -> Result<Option<ActiveMessage>, StateError> {
        let _guard = self.mutation.lock().await;
        let Some(message) = self.read().active.clone() else {
            debug!("Acknowledge requested with no active message");
            return Ok(None);
        };
        if !self.advance_watermark_locked(message.sent_at_utc)? {
            warn!(
                "Active message sent at {} is not newer than watermark {}",
                message.sent_at_utc,
                self.acked_until_utc()
            );
        }
        self.replace_active_locked(None)?;
        Ok(Some(message))
    }

    fn advance_watermark_locked(&self, sent_at_utc: i64) -> Result<bool, StateError> {
        let current = self.acked_until_utc();
        if sent_at_utc <= current {
            return Ok(false);
        }
        self.backend
            .store(KEY_ACKED_UNTIL, &bincode::serialize(&sent_at_utc)?)?;
        self.write().acked_until_utc = sent_at_utc;
        info!("Ack watermark advanced {} -> {}", current, sent_at_utc);
        Ok(true)
    }

    fn replace_active_locked(
        &self,
        message: Option<ActiveMessage>,
    ) -> Result<MessageChange, StateError> {
        if self.read().active == message {
            return Ok(MessageChange::Unchanged);
        }
        if let Some(m) = &message {
            let acked_until = self.acked_until_utc();
            if m.sent_at_utc <= acked_until {
                debug!(
                    "Discarding message from {} sent at {}: already acknowledged (watermark {})",
                    escape_log(&m.sender),
                    m.sent_at_utc,
                    acked_until
                );
                return Ok(MessageChange::Unchanged);
            }
        }
        match &message {
            Some(m) => self
                .backend
                .store(KEY_ACTIVE_MESSAGE, &bincode::serialize(m)?)?,
            None => self.backend.remove(KEY_ACTIVE_MESSAGE)?,
        }
        self.write().active = message.clone();

        let change = match &message {
            Some(m) => {
                info!(
                    "Active message from {} sent at {}: {}",
                    escape_log(&m.sender),
                    m.sent_at_utc,
                    escape_log(&m.body)
                );
                MessageChange::Replaced
            }
            None => {
                info!("Active message cleared");
                MessageChange::Cleared
            }
        };

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for listener in listeners {
            listener.message_changed(message.as_ref());
        }
        Ok(change)
    }

    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.snapshot.write().unwrap_or_else(|p| p.into_inner())
    }
}

fn decode<T: serde::de::DeserializeOwned>(bytes: Option<Vec<u8>>) -> Result<Option<T>, StateError> {
    match bytes {
        Some(b) => Ok(Some(bincode::deserialize::<T>(&b)?)),
        None => Ok(None),
    }
}
