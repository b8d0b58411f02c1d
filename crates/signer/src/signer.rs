//! Audit record signing and verification.

use crate::error::{SignerError, SignerResult};
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Field holding the hex-encoded signature in a stored record.
pub const SIGNATURE_FIELD: &str = "signature";

/// Canonical JSON bytes of a record, with the signature field excluded.
///
/// Keys are sorted and whitespace removed, so the result does not depend
/// on the order fields were inserted in.
pub fn canonicalize(fields: &Map<String, Value>) -> SignerResult<Vec<u8>> {
    let unsigned: Map<String, Value> = fields
        .iter()
        .filter(|(key, _)| key.as_str() != SIGNATURE_FIELD)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    serde_jcs::to_vec(&unsigned).map_err(|e| SignerError::Canonicalization(e.to_string()))
}

/// HMAC-SHA256 signer for audit records.
#[derive(Clone)]
pub struct AuditSigner {
    key: Vec<u8>,
}

impl AuditSigner {
    /// Create a signer from a shared secret.
    pub fn new(secret: impl AsRef<[u8]>) -> SignerResult<Self> {
        let key = secret.as_ref();
        if key.is_empty() {
            return Err(SignerError::InvalidKey("secret must not be empty".to_string()));
        }
        Ok(Self { key: key.to_vec() })
    }

    fn mac(&self) -> SignerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| SignerError::InvalidKey(e.to_string()))
    }

    /// Sign the record's fields, returning the lowercase hex signature.
    pub fn sign_fields(&self, fields: &Map<String, Value>) -> SignerResult<String> {
        let canonical = canonicalize(fields)?;
        let mut mac = self.mac()?;
        mac.update(&canonical);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check the record's embedded signature.
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not match,
    /// and an error when the record carries no usable signature.
    pub fn verify_fields(&self, fields: &Map<String, Value>) -> SignerResult<bool> {
        let stored = match fields.get(SIGNATURE_FIELD) {
            Some(Value::String(sig)) => sig,
            Some(_) => {
                return Err(SignerError::InvalidSignature(
                    "signature is not a string".to_string(),
                ));
            }
            None => return Err(SignerError::InvalidSignature("missing signature".to_string())),
        };
        let stored =
            hex::decode(stored).map_err(|e| SignerError::InvalidSignature(e.to_string()))?;

        let canonical = canonicalize(fields)?;
        let mut mac = self.mac()?;
        mac.update(&canonical);
        let computed = mac.finalize().into_bytes();

        if stored.len() != computed.len() {
            return Ok(false);
        }
        Ok(stored.ct_eq(computed.as_slice()).into())
    }

    /// Verify one stored JSON line, failing unless the signature matches.
    pub fn verify_line(&self, line: &str) -> SignerResult<()> {
        let value: Value = serde_json::from_str(line.trim_end())
            .map_err(|e| SignerError::InvalidRecord(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(SignerError::InvalidRecord(
                "record is not a JSON object".to_string(),
            ));
        };
        if self.verify_fields(&fields)? {
            Ok(())
        } else {
            Err(SignerError::VerificationFailed)
        }
    }
}

impl fmt::Debug for AuditSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditSigner")
            .field("key", &"<redacted>")
            .finish()
    }
}
