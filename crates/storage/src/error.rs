//! Storage error types.

use thiserror::Error;

/// Export root access errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    /// The request tried to leave the export root. Kept distinct from
    /// `NotFound` so it can be logged and audited as a security event.
    #[error("path escapes export root: {0}")]
    Traversal(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("artifact changed while being read: {0}")]
    Unstable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Map an I/O error, treating a vanished file as `NotFound`.
    pub fn from_io(err: std::io::Error, what: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(what.to_string())
        } else {
            Self::Io(err)
        }
    }

    pub(crate) fn join(err: tokio::task::JoinError) -> Self {
        Self::Io(std::io::Error::other(format!("spawn_blocking failed: {err}")))
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
