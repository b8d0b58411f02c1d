//! Content digest cache.
//!
//! Digests are keyed by canonical path and are only valid while the file's
//! size and modification time match the values observed when hashing. A
//! mismatch always forces recomputation, so a stale digest is never served.

use crate::error::{StorageError, StorageResult};
use dashmap::DashMap;
use exgate_core::{Artifact, ContentHash};
use std::fs::Metadata;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, instrument};

/// Attempts at hashing a file that keeps changing underneath us.
const MAX_DIGEST_ATTEMPTS: usize = 3;

/// A digest together with the file metadata it was computed against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DigestEntry {
    pub digest: ContentHash,
    pub size: u64,
    pub modified: SystemTime,
}

impl DigestEntry {
    /// True when `meta` still describes the hashed content.
    pub fn matches(&self, meta: &Metadata) -> bool {
        meta.len() == self.size && meta.modified().ok() == Some(self.modified)
    }

    /// Artifact view of this entry.
    pub fn artifact(&self, relative_path: impl Into<String>) -> Artifact {
        Artifact {
            relative_path: relative_path.into(),
            size_bytes: self.size,
            modified_at: self.modified,
            content_digest: self.digest,
        }
    }
}

/// Result of a cache lookup.
#[derive(Clone, Copy, Debug)]
pub struct DigestLookup {
    pub entry: DigestEntry,
    /// False when the digest was (re)computed for this request.
    pub cache_hit: bool,
}

/// Process-local cache of artifact digests, one entry per path.
///
/// Concurrent misses for the same path may hash the file more than once.
/// Each computation inserts a complete entry with a single map write, so
/// readers never observe a partial value.
#[derive(Debug)]
pub struct DigestCache {
    entries: DashMap<PathBuf, DigestEntry>,
    chunk_size: usize,
}

impl DigestCache {
    /// Create an empty cache that hashes in `chunk_size` reads.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            entries: DashMap::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Read size used when hashing.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Digest, size and mtime for the file at `path`.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn digest_for(&self, path: &Path) -> StorageResult<DigestLookup> {
        let what = path.display().to_string();
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::NotFound {
                    self.invalidate(path);
                }
                return Err(StorageError::from_io(e, &what));
            }
        };

        if let Some(entry) = self.cached(path)
            && entry.matches(&meta)
        {
            return Ok(DigestLookup {
                entry,
                cache_hit: true,
            });
        }

        for attempt in 1..=MAX_DIGEST_ATTEMPTS {
            let owned = path.to_path_buf();
            let chunk_size = self.chunk_size;
            let computed = tokio::task::spawn_blocking(move || hash_file_sync(&owned, chunk_size))
                .await
                .map_err(StorageError::join)?;

            match computed {
                Ok(Some(entry)) => {
                    self.entries.insert(path.to_path_buf(), entry);
                    debug!(attempt, size = entry.size, digest = %entry.digest, "computed digest");
                    return Ok(DigestLookup {
                        entry,
                        cache_hit: false,
                    });
                }
                Ok(None) => {
                    debug!(attempt, "file changed while hashing, retrying");
                }
                Err(e) => {
                    if matches!(e, StorageError::NotFound(_)) {
                        self.invalidate(path);
                    }
                    return Err(e);
                }
            }
        }

        Err(StorageError::Unstable(what))
    }

    /// The cached entry for `path`, without checking it against the file.
    pub fn cached(&self, path: &Path) -> Option<DigestEntry> {
        self.entries.get(path).map(|entry| *entry)
    }

    /// Drop the entry for `path`.
    pub fn invalidate(&self, path: &Path) {
        self.entries.remove(path);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Hash a file in fixed-size chunks.
///
/// Returns `None` when the file's size or mtime changed during the pass
/// (including a replacement of the path by another file).
fn hash_file_sync(path: &Path, chunk_size: usize) -> StorageResult<Option<DigestEntry>> {
    let what = path.display().to_string();
    let mut file = std::fs::File::open(path).map_err(|e| StorageError::from_io(e, &what))?;
    let before = file.metadata()?;
    if !before.is_file() {
        return Err(StorageError::NotFound(what));
    }
    let modified = before.modified()?;

    let mut hasher = ContentHash::hasher();
    let mut buf = vec![0u8; chunk_size];
    let mut read_total = 0u64;
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StorageError::Io(e)),
        };
        hasher.update(&buf[..n]);
        read_total += n as u64;
    }

    let entry = DigestEntry {
        digest: hasher.finalize(),
        size: before.len(),
        modified,
    };

    let after = file.metadata()?;
    let on_disk = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) => return Err(StorageError::from_io(e, &what)),
    };
    let stable = read_total == entry.size && entry.matches(&after) && entry.matches(&on_disk);

    Ok(stable.then_some(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_computes_then_hits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("demo.zip");
        std::fs::write(&path, b"checksum").unwrap();

        let cache = DigestCache::new(4096);
        let first = cache.digest_for(&path).await.unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.entry.digest, ContentHash::compute(b"checksum"));
        assert_eq!(first.entry.size, 8);

        let second = cache.digest_for(&path).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.entry, first.entry);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_small_chunks_match_one_shot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.zip");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let cache = DigestCache::new(7);
        let lookup = cache.digest_for(&path).await.unwrap();
        assert_eq!(lookup.entry.digest, ContentHash::compute(&data));
    }

    #[tokio::test]
    async fn test_changed_metadata_forces_recompute() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("demo.zip");
        std::fs::write(&path, b"first").unwrap();

        let cache = DigestCache::new(4096);
        let first = cache.digest_for(&path).await.unwrap();

        std::fs::write(&path, b"second version").unwrap();
        let second = cache.digest_for(&path).await.unwrap();
        assert!(!second.cache_hit);
        assert_ne!(first.entry.digest, second.entry.digest);
        assert_eq!(second.entry.digest, ContentHash::compute(b"second version"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_same_size_new_mtime_forces_recompute() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("demo.zip");
        std::fs::write(&path, b"aaaa").unwrap();

        let cache = DigestCache::new(4096);
        cache.digest_for(&path).await.unwrap();

        std::fs::write(&path, b"bbbb").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        drop(file);

        let lookup = cache.digest_for(&path).await.unwrap();
        assert!(!lookup.cache_hit);
        assert_eq!(lookup.entry.digest, ContentHash::compute(b"bbbb"));
    }

    #[tokio::test]
    async fn test_missing_file_evicts_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("demo.zip");
        std::fs::write(&path, b"checksum").unwrap();

        let cache = DigestCache::new(4096);
        cache.digest_for(&path).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            cache.digest_for(&path).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_misses_agree_with_reference() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.zip");
        let data = vec![42u8; 300_000];
        std::fs::write(&path, &data).unwrap();
        let reference = ContentHash::compute(&data);

        let cache = Arc::new(DigestCache::new(4096));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                cache.digest_for(&path).await.unwrap().entry.digest
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), reference);
        }
        assert_eq!(cache.cached(&path).unwrap().digest, reference);
    }

    #[test]
    fn test_entry_to_artifact() {
        let entry = DigestEntry {
            digest: ContentHash::compute(b"checksum"),
            size: 8,
            modified: SystemTime::UNIX_EPOCH,
        };
        let artifact = entry.artifact("nightly/demo.zip");
        assert_eq!(artifact.file_name(), "demo.zip");
        assert_eq!(artifact.size_bytes, 8);
    }
}
