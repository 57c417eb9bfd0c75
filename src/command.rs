//! One-byte command alphabet spoken with the indicator, and the encoder that sends
//! blink commands and turns dismiss bytes into acknowledgements.
//!
//! | Byte | Meaning |
//! |------|---------|
//! | `0x00` | dismiss (indicator → us) |
//! | `on << 4 \| off` | blink `on` seconds lit, `off` seconds dark (us → indicator) |

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{ArmedFlag, MAX_BLINK_SECONDS};
use crate::link::{ByteReceiver, LinkError, LinkTransport};
use crate::logutil::hex_bytes;
use crate::state::{ActiveMessage, MessageListener};

pub const DISMISS_BYTE: u8 = 0x00;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("blink durations must be within 0-{max} seconds (got on={on}, off={off})")]
    OutOfRange { on: u8, off: u8, max: u8 },
    #[error("blink on and off durations cannot both be zero")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Dismiss,
    Blink { on_seconds: u8, off_seconds: u8 },
}

impl Command {
    pub fn blink(on_seconds: u8, off_seconds: u8) -> Result<Self, CommandError> {
        if on_seconds > MAX_BLINK_SECONDS || off_seconds > MAX_BLINK_SECONDS {
            return Err(CommandError::OutOfRange {
                on: on_seconds,
                off: off_seconds,
                max: MAX_BLINK_SECONDS,
            });
        }
        if on_seconds == 0 && off_seconds == 0 {
            return Err(CommandError::Empty);
        }
        Ok(Command::Blink {
            on_seconds,
            off_seconds,
        })
    }

    pub fn encode(self) -> u8 {
        match self {
            Command::Dismiss => DISMISS_BYTE,
            Command::Blink {
                on_seconds,
                off_seconds,
            } => (on_seconds << 4) | (off_seconds & 0x0F),
        }
    }

    pub fn decode(byte: u8) -> Self {
        match byte {
            DISMISS_BYTE => Command::Dismiss,
            b => Command::Blink {
                on_seconds: b >> 4,
                off_seconds: b & 0x0F,
            },
        }
    }
}

/// What `start_blinking` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Sent { attempts: u32 },
    Disarmed,
}

type PendingBlink = JoinHandle<Result<CommandOutcome, LinkError>>;

/// Sends the configured blink pattern and routes inbound dismiss bytes.
///
/// Registered as a [`MessageListener`]: whenever a new message becomes active the
/// encoder spawns a blink send, so the state mutation never waits on the link.
#[derive(Clone)]
pub struct CommandEncoder {
    transport: Arc<LinkTransport>,
    armed: ArmedFlag,
    blink: Command,
    pending: Arc<Mutex<Option<PendingBlink>>>,
}

impl CommandEncoder {
    pub fn new(transport: Arc<LinkTransport>, armed: ArmedFlag, blink: Command) -> Self {
        Self {
            transport,
            armed,
            blink,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    pub fn blink_command(&self) -> Command {
        self.blink
    }

    pub fn transport(&self) -> &Arc<LinkTransport> {
        &self.transport
    }

    /// Send the blink pattern unless the notifier is disarmed.
    pub async fn start_blinking(&self) -> Result<CommandOutcome, LinkError> {
        if !self.armed.is_armed() {
            debug!("Not armed; skipping blink");
            return Ok(CommandOutcome::Disarmed);
        }
        let byte = self.blink.encode();
        match self.transport.send(byte).await {
            Ok(report) => {
                info!("Blink {} sent to indicator", hex_bytes(&[byte]));
                Ok(CommandOutcome::Sent {
                    attempts: report.attempts,
                })
            }
            Err(e) => {
                warn!("Blink {} not delivered: {}", hex_bytes(&[byte]), e);
                Err(e)
            }
        }
    }

    /// Invoke `on_dismiss` whenever the indicator sends the dismiss byte. Other
    /// inbound bytes are ignored.
    pub fn register_dismisser<F>(&self, on_dismiss: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let receiver: ByteReceiver = Arc::new(move |byte: u8| match Command::decode(byte) {
            Command::Dismiss => {
                info!("Indicator dismissed the active message");
                on_dismiss();
            }
            other => debug!("Ignoring inbound {} ({:?})", hex_bytes(&[byte]), other),
        });
        self.transport.listener().set_receiver(Some(receiver));
    }

    /// Wait for the blink spawned by the latest message change, if one is pending.
    pub async fn wait_for_blink(&self) -> Option<Result<CommandOutcome, LinkError>> {
        let handle = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()?;
        Some(
            handle
                .await
                .unwrap_or_else(|e| Err(LinkError::Task(e.to_string()))),
        )
    }

    fn spawn_blink(&self) {
        let encoder = self.clone();
        let handle = tokio::spawn(async move { encoder.start_blinking().await });
        *self.pending.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }
}

impl MessageListener for CommandEncoder {
    fn message_changed(&self, message: Option<&ActiveMessage>) {
        if message.is_some() {
            self.spawn_blink();
        }
    }
}
