//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid artifact path: {0}")]
    InvalidArtifactPath(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("export root unavailable: {0}")]
    ExportRootUnavailable(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
