//! Signer error types.

use thiserror::Error;

/// Signing operation errors.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("canonicalization failed: {0}")]
    Canonicalization(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid signature format: {0}")]
    InvalidSignature(String),

    #[error("verification failed")]
    VerificationFailed,
}

/// Result type for signing operations.
pub type SignerResult<T> = std::result::Result<T, SignerError>;
