//! Test doubles for the trait seams: a scripted backend, an in-memory indicator
//! link and a recording message listener.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pinotify::link::{LinkConnector, LinkError, LinkStream};
use pinotify::state::{ActiveMessage, MessageListener};
use pinotify::sync::{BackendApi, DeviceRequest, DeviceResponse, SyncError};

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Answers device requests from a queue; an empty queue means "no message".
#[derive(Default)]
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<Result<DeviceResponse, SyncError>>>,
    requests: Mutex<Vec<DeviceRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, response: Result<DeviceResponse, SyncError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn respond_message(&self, sender: &str, body: &str, date: i64) {
        self.respond(Ok(message_response(sender, body, date)));
    }

    pub fn requests(&self) -> Vec<DeviceRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendApi for ScriptedBackend {
    async fn device_request(&self, request: &DeviceRequest) -> Result<DeviceResponse, SyncError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(DeviceResponse::default()))
    }
}

pub fn message_response(sender: &str, body: &str, date: i64) -> DeviceResponse {
    DeviceResponse {
        message: Some(body.to_string()),
        date: Some(date),
        sender: Some(sender.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Message listener
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<Option<ActiveMessage>>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<Option<ActiveMessage>> {
        self.seen.lock().unwrap().clone()
    }
}

impl MessageListener for Recorder {
    fn message_changed(&self, message: Option<&ActiveMessage>) {
        self.seen.lock().unwrap().push(message.cloned());
    }
}

// ---------------------------------------------------------------------------
// Indicator link
// ---------------------------------------------------------------------------

/// How the next `open` call behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPlan {
    /// Opening fails.
    Refuse,
    /// Stream opens and writes succeed.
    Healthy,
    /// Stream opens but every write fails.
    BrokenWrites,
}

/// In-memory indicator. Each opened stream gets an inbound channel the test
/// can feed with frames; dropping that channel is an end-of-stream.
#[derive(Default)]
pub struct MockConnector {
    plans: Mutex<VecDeque<OpenPlan>>,
    opens: AtomicUsize,
    open_now: Arc<AtomicUsize>,
    max_open: Arc<AtomicUsize>,
    written: Arc<Mutex<Vec<u8>>>,
    inbound: Mutex<Vec<Option<Sender<Vec<u8>>>>>,
    device_present: Mutex<bool>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        let connector = Self::default();
        *connector.device_present.lock().unwrap() = true;
        Arc::new(connector)
    }

    /// Queue plans for the next opens; once exhausted every open is healthy.
    pub fn plan(&self, plans: &[OpenPlan]) {
        self.plans.lock().unwrap().extend(plans.iter().copied());
    }

    pub fn set_device_present(&self, present: bool) {
        *self.device_present.lock().unwrap() = present;
    }

    /// Number of `open` calls that produced a stream.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn open_streams(&self) -> usize {
        self.open_now.load(Ordering::SeqCst)
    }

    pub fn max_open_streams(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    /// Bytes successfully written, across all streams.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    /// Deliver one read's worth of bytes on the most recently opened stream.
    pub fn deliver(&self, frame: &[u8]) {
        let inbound = self.inbound.lock().unwrap();
        if let Some(Some(tx)) = inbound.last() {
            let _ = tx.send(frame.to_vec());
        }
    }

    /// The indicator closes the most recently opened stream.
    pub fn hang_up(&self) {
        let mut inbound = self.inbound.lock().unwrap();
        if let Some(slot) = inbound.last_mut() {
            slot.take();
        }
    }
}

impl LinkConnector for MockConnector {
    fn resolve(&self, remote: &str) -> Result<String, LinkError> {
        if *self.device_present.lock().unwrap() {
            Ok(remote.to_string())
        } else {
            Err(LinkError::DeviceNotFound(remote.to_string()))
        }
    }

    fn open(&self, address: &str) -> Result<Box<dyn LinkStream>, LinkError> {
        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(OpenPlan::Healthy);
        if plan == OpenPlan::Refuse {
            return Err(LinkError::OpenFailed {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        let now = self.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel();
        self.inbound.lock().unwrap().push(Some(tx));
        Ok(Box::new(MockStream {
            fail_writes: plan == OpenPlan::BrokenWrites,
            written: self.written.clone(),
            reader: Arc::new(Mutex::new(Some(rx))),
            open_now: self.open_now.clone(),
            closed: false,
        }))
    }
}

pub struct MockStream {
    fail_writes: bool,
    written: Arc<Mutex<Vec<u8>>>,
    reader: Arc<Mutex<Option<Receiver<Vec<u8>>>>>,
    open_now: Arc<AtomicUsize>,
    closed: bool,
}

impl Read for MockStream {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "read via the cloned reader"))
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed || self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "indicator went away"));
        }
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LinkStream for MockStream {
    fn try_clone_reader(&self) -> io::Result<Box<dyn Read + Send>> {
        match self.reader.lock().unwrap().take() {
            Some(rx) => Ok(Box::new(MockReader { rx })),
            None => Err(io::Error::new(io::ErrorKind::Other, "reader already taken")),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        if !self.closed {
            self.closed = true;
            self.open_now.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct MockReader {
    rx: Receiver<Vec<u8>>,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.recv_timeout(Duration::from_millis(20)) {
            Ok(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
            }
            Err(RecvTimeoutError::Disconnected) => Ok(0),
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
