//! Test fixtures for generating test data.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::time::SystemTime;

/// Generate deterministic test data based on a seed.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Compute SHA-256 hash of data as hex string.
#[allow(dead_code)]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Strong entity tag the gateway sends for an archive with this content.
#[allow(dead_code)]
pub fn archive_etag(data: &[u8]) -> String {
    format!("\"{}\"", sha256_hex(data))
}

/// IMF-fixdate for `time`, as sent in `If-Modified-Since`.
#[allow(dead_code)]
pub fn http_date(time: SystemTime) -> String {
    httpdate::fmt_http_date(time)
}
