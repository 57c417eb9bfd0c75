//! Background reader for the indicator link.
//!
//! One blocking read loop per session, run on tokio's blocking pool. Every frame
//! must be exactly one byte; anything else (EOF, a multi-byte read, an IO error)
//! closes the session and ends the loop. The loop is never restarted here: the
//! transport starts a new one after its next successful send.

use std::io::{ErrorKind, Read};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, error, info, trace, warn};
use tokio::task::JoinHandle;

use super::LinkSession;
use crate::logutil::hex_bytes;

/// Callback receiving each well-formed inbound byte.
pub type ByteReceiver = Arc<dyn Fn(u8) + Send + Sync>;

const READ_BUFFER: usize = 1024;

/// Why a listener loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerExit {
    /// The remote closed the stream.
    EndOfStream,
    /// A read returned this many bytes instead of one.
    MalformedFrame(usize),
    /// The session was closed or replaced by the transport.
    SessionClosed,
    /// The read half failed.
    ReadError(ErrorKind),
}

struct Running {
    session_id: u64,
    handle: Option<JoinHandle<ListenerExit>>,
}

#[derive(Default)]
pub struct LinkListener {
    receiver: Arc<RwLock<Option<ByteReceiver>>>,
    running: Mutex<Option<Running>>,
}

impl LinkListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or remove) the callback for inbound bytes. Takes effect for the
    /// running loop as well as future ones.
    pub fn set_receiver(&self, receiver: Option<ByteReceiver>) {
        *self.receiver.write().unwrap_or_else(|p| p.into_inner()) = receiver;
    }

    /// Start reading `session`. Returns `Ok(false)` when a loop was already started
    /// for this session.
    pub fn start(&self, session: &LinkSession) -> std::io::Result<bool> {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(current) = running.as_ref() {
            if current.session_id == session.id() {
                debug!("Already listening on link session {}", session.id());
                return Ok(false);
            }
        }

        let reader = session.reader()?;
        let session_id = session.id();
        let session = session.clone();
        let receiver = self.receiver.clone();
        info!("Starting link listener for session {}", session_id);
        let handle = tokio::task::spawn_blocking(move || read_loop(reader, session, receiver));
        *running = Some(Running {
            session_id,
            handle: Some(handle),
        });
        Ok(true)
    }

    /// Session id the most recent loop was started for.
    pub fn session_id(&self) -> Option<u64> {
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|r| r.session_id)
    }

    /// True while the most recently started loop is still reading.
    pub fn is_listening(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .and_then(|r| r.handle.as_ref())
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Wait for the most recently started loop to stop and report why. Returns
    /// `None` if no loop was started or its exit was already collected.
    pub async fn wait_for_exit(&self) -> Option<ListenerExit> {
        let handle = self
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_mut()
            .and_then(|r| r.handle.take())?;
        match handle.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                error!("Link listener task failed: {}", e);
                None
            }
        }
    }
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    session: LinkSession,
    receiver: Arc<RwLock<Option<ByteReceiver>>>,
) -> ListenerExit {
    let mut buf = [0u8; READ_BUFFER];
    let exit = loop {
        if session.is_closed() {
            break ListenerExit::SessionClosed;
        }
        match reader.read(&mut buf) {
            Ok(0) => {
                warn!("Unexpected end of stream on link session {}", session.id());
                break ListenerExit::EndOfStream;
            }
            Ok(1) => {
                let byte = buf[0];
                trace!("Link rx {}", hex_bytes(&buf[..1]));
                let callback = receiver.read().unwrap_or_else(|p| p.into_inner()).clone();
                match callback {
                    Some(cb) => cb(byte),
                    None => debug!("No receiver registered; dropping {}", hex_bytes(&[byte])),
                }
            }
            Ok(n) => {
                error!(
                    "Unexpected link frame of {} bytes: {}",
                    n,
                    hex_bytes(&buf[..n])
                );
                break ListenerExit::MalformedFrame(n);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                warn!("Link read error on session {}: {}", session.id(), e);
                break ListenerExit::ReadError(e.kind());
            }
        }
    };
    if exit != ListenerExit::SessionClosed {
        session.close();
    }
    info!("Link listener for session {} exited: {:?}", session.id(), exit);
    exit
}
