//! Durable key/value backends behind [`StateStore`](super::StateStore).

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::errors::StateError;

const TREE_STATE: &str = "pinotify_state";

/// Byte-level persistence used by the state store. Every `store`/`remove` must be
/// durable when it returns `Ok`.
pub trait StateBackend: Send + Sync {
    fn load(&self, key: &'static str) -> Result<Option<Vec<u8>>, StateError>;
    fn store(&self, key: &'static str, value: &[u8]) -> Result<(), StateError>;
    fn remove(&self, key: &'static str) -> Result<(), StateError>;
}

/// Sled-backed persistence; each write is flushed before returning.
pub struct SledBackend {
    _db: sled::Db,
    state: sled::Tree,
}

impl SledBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        let state = db.open_tree(TREE_STATE)?;
        Ok(Self { _db: db, state })
    }
}

impl StateBackend for SledBackend {
    fn load(&self, key: &'static str) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.state.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn store(&self, key: &'static str, value: &[u8]) -> Result<(), StateError> {
        self.state.insert(key.as_bytes(), value)?;
        self.state.flush()?;
        Ok(())
    }

    fn remove(&self, key: &'static str) -> Result<(), StateError> {
        self.state.remove(key.as_bytes())?;
        self.state.flush()?;
        Ok(())
    }
}

/// Process-local backend. Writes can be made to fail on demand, which lets callers
/// exercise the persistence error path.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<&'static str, Vec<u8>>>,
    reject_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, `store` and `remove` fail without touching the stored entries.
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    fn check_writable(&self, key: &'static str) -> Result<(), StateError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StateError::WriteRejected {
                key,
                reason: "backend is read-only".to_string(),
            });
        }
        Ok(())
    }
}

impl StateBackend for MemoryBackend {
    fn load(&self, key: &'static str) -> Result<Option<Vec<u8>>, StateError> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn store(&self, key: &'static str, value: &[u8]) -> Result<(), StateError> {
        self.check_writable(key)?;
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(key, value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &'static str) -> Result<(), StateError> {
        self.check_writable(key)?;
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.remove(key);
        Ok(())
    }
}

impl<B: StateBackend + ?Sized> StateBackend for std::sync::Arc<B> {
    fn load(&self, key: &'static str) -> Result<Option<Vec<u8>>, StateError> {
        (**self).load(key)
    }

    fn store(&self, key: &'static str, value: &[u8]) -> Result<(), StateError> {
        (**self).store(key, value)
    }

    fn remove(&self, key: &'static str) -> Result<(), StateError> {
        (**self).remove(key)
    }
}
