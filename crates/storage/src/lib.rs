//! Export root access for exgate.
//!
//! This crate provides:
//! - Request path resolution confined to the export root
//! - A per-path SHA-256 digest cache validated against size and mtime
//! - Chunked, bounded-memory artifact streaming

pub mod digest;
pub mod error;
pub mod export_root;
pub mod reader;

pub use digest::{DigestCache, DigestEntry, DigestLookup};
pub use error::{StorageError, StorageResult};
pub use export_root::{ExportRoot, ResolvedArtifact};
pub use reader::{ByteStream, chunked_stream, open_matching};
