//! Audit record signing for exgate.
//!
//! This crate provides:
//! - Canonical JSON encoding of audit records (RFC 8785, signature excluded)
//! - HMAC-SHA256 signing
//! - Constant-time verification of stored records

pub mod error;
pub mod signer;

pub use error::{SignerError, SignerResult};
pub use signer::{AuditSigner, SIGNATURE_FIELD, canonicalize};
