//! # Notifier Service
//!
//! Wires the state store, sync client and command encoder together and runs the
//! trigger loop:
//!
//! ```text
//! push / poll timer / user ──▶ Trigger queue ──▶ request_sync ──▶ StateStore
//!                                    ▲                               │ message changed
//!     indicator dismiss (0x00) ──────┘ Ack                           ▼
//!                                                          CommandEncoder ──▶ LinkTransport
//! ```
//!
//! Each trigger runs on its own task, so a slow backend call never delays a blink
//! and a link stuck in its retry loop never delays a sync.

mod trigger;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::command::CommandEncoder;
use crate::logutil::escape_log;
use crate::state::{ActiveMessage, MessageListener, StateError, StateStore};
use crate::sync::{SyncClient, SyncError};
pub use trigger::{Trigger, TriggerHandle};

/// UI surface that writes the displayed message to the log.
#[derive(Debug, Default)]
pub struct LogDisplay;

impl MessageListener for LogDisplay {
    fn message_changed(&self, message: Option<&ActiveMessage>) {
        match message {
            Some(m) => info!(
                "Displaying message from {}: {}",
                escape_log(&m.sender),
                escape_log(&m.body)
            ),
            None => info!("Display cleared"),
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    store: Arc<StateStore>,
    sync: Arc<SyncClient>,
    encoder: CommandEncoder,
}

impl Notifier {
    /// Connect the pieces: the encoder starts listening for new active messages.
    pub fn new(sync: Arc<SyncClient>, encoder: CommandEncoder) -> Self {
        let store = sync.store().clone();
        store.add_listener(Arc::new(encoder.clone()));
        Self {
            store,
            sync,
            encoder,
        }
    }

    /// Register the UI notification callback.
    pub fn add_display(&self, display: Arc<dyn MessageListener>) {
        self.store.add_listener(display);
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn sync(&self) -> &Arc<SyncClient> {
        &self.sync
    }

    pub fn encoder(&self) -> &CommandEncoder {
        &self.encoder
    }

    /// Acknowledge the active message and tell the backend the watermark moved.
    ///
    /// The watermark write and the clear are both durable before the follow-up sync
    /// is sent. A failed follow-up sync is logged; the next trigger repeats it.
    pub async fn ack_current_message(&self) -> Result<Option<ActiveMessage>, StateError> {
        let acked = self.store.acknowledge_active().await?;
        if let Some(message) = &acked {
            info!(
                "Acknowledged message from {} sent at {}",
                escape_log(&message.sender),
                message.sent_at_utc
            );
            if let Err(e) = self.sync.request_sync(None).await {
                warn!("Follow-up sync after ack failed: {}", e);
            }
        }
        Ok(acked)
    }

    /// Store a refreshed device token and sync so the backend learns it.
    pub async fn update_device_token(&self, token: &str) -> Result<(), SyncError> {
        self.store.set_device_token(token).await?;
        self.sync.request_sync(None).await?;
        Ok(())
    }

    /// Start the trigger loop. Dismiss bytes from the indicator are routed into the
    /// loop as [`Trigger::Ack`]; with `poll_interval` set a sync is triggered on
    /// that period.
    pub fn spawn(&self, poll_interval: Option<Duration>) -> (TriggerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel::<Trigger>();
        let handle = TriggerHandle::new(tx);

        let dismiss = handle.clone();
        self.encoder.register_dismisser(move || {
            if !dismiss.ack() {
                debug!("Dismiss received after notifier shutdown");
            }
        });

        let poll = poll_interval.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        let notifier = self.clone();
        let join = tokio::spawn(async move { notifier.run(rx, poll).await });
        (handle, join)
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<Trigger>, mut poll: Option<Interval>) {
        info!("Notifier loop started");
        loop {
            tokio::select! {
                trigger = rx.recv() => match trigger {
                    Some(Trigger::Shutdown) | None => break,
                    Some(trigger) => self.dispatch(trigger),
                },
                _ = next_tick(&mut poll) => self.dispatch(Trigger::Poll),
            }
        }
        self.encoder.transport().disconnect().await;
        info!("Notifier loop stopped");
    }

    fn dispatch(&self, trigger: Trigger) {
        debug!("Trigger: {:?}", trigger);
        match trigger {
            Trigger::Push { id } => {
                self.sync.spawn_sync(id);
            }
            Trigger::Poll => {
                self.sync.spawn_sync(None);
            }
            Trigger::Ack => {
                let notifier = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = notifier.ack_current_message().await {
                        warn!("Acknowledge failed: {}", e);
                    }
                });
            }
            Trigger::DeviceToken(token) => {
                let notifier = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = notifier.update_device_token(&token).await {
                        warn!("Device token update incomplete: {}", e);
                    }
                });
            }
            Trigger::Shutdown => {}
        }
    }
}

async fn next_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
