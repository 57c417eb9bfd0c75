use thiserror::Error;

/// Errors raised by the local state store and its backends.
#[derive(Debug, Error)]
pub enum StateError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend refused a write; nothing was persisted.
    #[error("write rejected for key {key}: {reason}")]
    WriteRejected { key: &'static str, reason: String },
}
