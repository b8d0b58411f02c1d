//! Core domain types and shared logic for the exgate export gateway.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Artifact metadata and route kinds (archive vs digest manifest)
//! - Content hashes and strong entity tags
//! - Conditional request evaluation (`If-None-Match` / `If-Modified-Since`)
//! - Gateway configuration and its startup validation

pub mod artifact;
pub mod conditional;
pub mod config;
pub mod error;
pub mod hash;

pub use artifact::{Artifact, ArtifactKind};
pub use conditional::{Freshness, RequestValidators};
pub use config::{AppConfig, CacheControlPolicy, RouteClass};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};

/// Default digest chunk size: 64 KiB
pub const DEFAULT_DIGEST_CHUNK_SIZE: usize = 64 * 1024;

/// Minimum digest chunk size: 4 KiB
pub const MIN_DIGEST_CHUNK_SIZE: usize = 4 * 1024;

/// Maximum digest chunk size: 16 MiB
pub const MAX_DIGEST_CHUNK_SIZE: usize = 16 * 1024 * 1024;
