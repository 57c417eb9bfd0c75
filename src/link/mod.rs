//! # Indicator Link
//!
//! Owns the single full-duplex byte stream to the indicator device and the state
//! machine around it:
//!
//! ```text
//!   Disconnected ──send()──▶ Connecting ──handshake ok──▶ Connected
//!        ▲                       │                            │
//!        └──── open failed ──────┘◀── write failed / listener closed
//! ```
//!
//! Opening the stream is delegated to a [`LinkConnector`] (the serial/RFCOMM
//! connector in production, scripted connectors in tests). All blocking work
//! (resolve, open, write, read) runs on tokio's blocking pool.
//!
//! `send` serializes against itself, connects on demand and retries a failed
//! write by reconnecting, bounded by `send_attempts` connect-and-write cycles in
//! total. A successful send (re)starts the [`LinkListener`] for the current
//! session.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pinotify::link::{LinkTransport, serial::SerialConnector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let connector = Arc::new(SerialConnector::new(9600));
//!     let transport = LinkTransport::new(connector, "/dev/rfcomm0", 3);
//!     let report = transport.send(0x22).await?;
//!     println!("sent on session {} after {} attempt(s)", report.session_id, report.attempts);
//!     Ok(())
//! }
//! ```

pub mod listener;
#[cfg(feature = "serial")]
pub mod serial;

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::logutil::hex_bytes;
pub use listener::{ByteReceiver, LinkListener, ListenerExit};

const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link device {0} not found")]
    DeviceNotFound(String),

    #[error("failed to open link to {address}: {reason}")]
    OpenFailed { address: String, reason: String },

    #[error("link io error: {0}")]
    Io(#[from] io::Error),

    #[error("could not send after {attempts} attempt(s): {last}")]
    AttemptsExhausted { attempts: u32, last: String },

    #[error("link task failed: {0}")]
    Task(String),
}

/// An open duplex byte stream to the indicator.
pub trait LinkStream: Read + Write + Send {
    /// Independent read half for the listener.
    fn try_clone_reader(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Release the underlying device. Reads and writes fail afterwards.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Discovers the indicator and opens streams to it. Both calls may block.
pub trait LinkConnector: Send + Sync {
    /// Map the configured remote identifier to an address that can be opened,
    /// failing when the paired device is not present.
    fn resolve(&self, remote: &str) -> Result<String, LinkError> {
        Ok(remote.to_string())
    }

    /// Open a stream and complete the connect handshake.
    fn open(&self, address: &str) -> Result<Box<dyn LinkStream>, LinkError>;
}

/// Handle to one open stream. Clones share the stream and the closed flag; the
/// transport owns the session, the listener only reads from it.
#[derive(Clone)]
pub struct LinkSession {
    id: u64,
    stream: Arc<Mutex<Box<dyn LinkStream>>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for LinkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSession")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LinkSession {
    fn new(id: u64, stream: Box<dyn LinkStream>) -> Self {
        Self {
            id,
            stream: Arc::new(Mutex::new(stream)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark the session closed and release the stream. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut stream = self.stream.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = stream.close() {
            debug!("Error closing link session {}: {}", self.id, e);
        }
        debug!("Link session {} closed", self.id);
    }

    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        let stream = self.stream.lock().unwrap_or_else(|p| p.into_inner());
        stream.try_clone_reader()
    }

    fn write_byte(&self, byte: u8) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "session closed"));
        }
        let mut stream = self.stream.lock().unwrap_or_else(|p| p.into_inner());
        stream.write_all(&[byte])?;
        stream.flush()
    }
}

/// Externally visible link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

enum LinkState {
    Disconnected,
    Connecting,
    Connected(LinkSession),
}

impl LinkState {
    fn status(&self) -> LinkStatus {
        match self {
            LinkState::Disconnected => LinkStatus::Disconnected,
            LinkState::Connecting => LinkStatus::Connecting,
            LinkState::Connected(_) => LinkStatus::Connected,
        }
    }
}

/// Result of a successful `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    /// Connect-and-write cycles used, starting at 1.
    pub attempts: u32,
    pub session_id: u64,
}

pub struct LinkTransport {
    connector: Arc<dyn LinkConnector>,
    remote: String,
    send_attempts: u32,
    close_grace: Duration,
    state: tokio::sync::Mutex<LinkState>,
    status: Mutex<LinkStatus>,
    listener: LinkListener,
    next_session_id: AtomicU64,
}

impl LinkTransport {
    pub fn new(connector: Arc<dyn LinkConnector>, remote: impl Into<String>, send_attempts: u32) -> Self {
        Self {
            connector,
            remote: remote.into(),
            send_attempts: send_attempts.max(1),
            close_grace: DEFAULT_CLOSE_GRACE,
            state: tokio::sync::Mutex::new(LinkState::Disconnected),
            status: Mutex::new(LinkStatus::Disconnected),
            listener: LinkListener::new(),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// How long teardown waits for the listener to release its read half before a
    /// new stream is opened.
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn listener(&self) -> &LinkListener {
        &self.listener
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Send one byte, connecting first if needed.
    pub async fn send(&self, byte: u8) -> Result<SendReport, LinkError> {
        let mut state = self.state.lock().await;

        let stale = match &*state {
            LinkState::Connected(session) if session.is_closed() => Some(session.clone()),
            _ => None,
        };
        if let Some(session) = stale {
            debug!("Link session {} was closed by the listener", session.id());
            self.teardown(&mut state, session).await;
        }

        let mut last_error: Option<LinkError> = None;
        for attempt in 1..=self.send_attempts {
            let current = match &*state {
                LinkState::Connected(session) => Some(session.clone()),
                _ => None,
            };
            let session = match current {
                Some(session) => session,
                None => match self.connect(&mut state).await {
                    Ok(session) => session,
                    Err(e) if attempt == 1 => return Err(e),
                    Err(e) => {
                        last_error = Some(e);
                        continue;
                    }
                },
            };

            match self.write(&session, byte).await {
                Ok(()) => {
                    debug!(
                        "Link tx {} on session {} (attempt {}/{})",
                        hex_bytes(&[byte]),
                        session.id(),
                        attempt,
                        self.send_attempts
                    );
                    if let Err(e) = self.listener.start(&session) {
                        warn!("Could not start link listener: {}", e);
                    }
                    return Ok(SendReport {
                        attempts: attempt,
                        session_id: session.id(),
                    });
                }
                Err(e) => {
                    warn!(
                        "Link write failed on session {} (attempt {}/{}): {}",
                        session.id(),
                        attempt,
                        self.send_attempts,
                        e
                    );
                    self.teardown(&mut state, session).await;
                    last_error = Some(LinkError::Io(e));
                }
            }
        }

        Err(LinkError::AttemptsExhausted {
            attempts: self.send_attempts,
            last: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Close the current session, if any.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        let current = match &*state {
            LinkState::Connected(session) => Some(session.clone()),
            _ => None,
        };
        if let Some(session) = current {
            info!("Disconnecting link session {}", session.id());
            self.teardown(&mut state, session).await;
        }
    }

    async fn connect(&self, state: &mut LinkState) -> Result<LinkSession, LinkError> {
        self.transition(state, LinkState::Connecting);
        let connector = self.connector.clone();
        let remote = self.remote.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let address = connector.resolve(&remote)?;
            connector.open(&address)
        })
        .await
        .map_err(|e| LinkError::Task(e.to_string()))
        .and_then(|r| r);

        match opened {
            Ok(stream) => {
                let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
                let session = LinkSession::new(id, stream);
                info!("Link connected to {} (session {})", self.remote, id);
                self.transition(state, LinkState::Connected(session.clone()));
                Ok(session)
            }
            Err(e) => {
                warn!("Link connect to {} failed: {}", self.remote, e);
                self.transition(state, LinkState::Disconnected);
                Err(e)
            }
        }
    }

    async fn write(&self, session: &LinkSession, byte: u8) -> io::Result<()> {
        let session = session.clone();
        tokio::task::spawn_blocking(move || session.write_byte(byte))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
    }

    async fn teardown(&self, state: &mut LinkState, session: LinkSession) {
        session.close();
        self.transition(state, LinkState::Disconnected);
        if self.listener.session_id() == Some(session.id()) {
            match tokio::time::timeout(self.close_grace, self.listener.wait_for_exit()).await {
                Ok(Some(exit)) => debug!("Listener for session {} stopped: {:?}", session.id(), exit),
                Ok(None) => {}
                Err(_) => warn!(
                    "Listener for session {} still reading after {:?}",
                    session.id(),
                    self.close_grace
                ),
            }
        }
    }

    fn transition(&self, state: &mut LinkState, next: LinkState) {
        let from = state.status();
        let to = next.status();
        *state = next;
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = to;
        if from != to {
            debug!("Link {:?} -> {:?}", from, to);
        }
    }
}

impl Drop for LinkTransport {
    fn drop(&mut self) {
        if let LinkState::Connected(session) = self.state.get_mut() {
            session.close();
        }
    }
}
