//! Export root path resolution.

use crate::error::{StorageError, StorageResult};
use exgate_core::ArtifactKind;
use percent_encoding::percent_decode_str;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{instrument, warn};

/// A read-only directory of artifacts.
///
/// Every path handed out by [`ExportRoot::resolve`] is a regular file
/// strictly inside the canonical root, after symlinks are resolved.
#[derive(Clone, Debug)]
pub struct ExportRoot {
    root: PathBuf,
}

/// A request path validated against the export root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedArtifact {
    /// Archive or manifest route.
    pub kind: ArtifactKind,
    /// Archive path relative to the root, as requested (decoded).
    pub relative_path: String,
    /// Canonical on-disk path of the archive.
    pub path: PathBuf,
}

impl ExportRoot {
    /// Open an existing export root.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref();
        let canonical = root.canonicalize().map_err(|e| {
            StorageError::Config(format!(
                "failed to canonicalize export root {}: {e}",
                root.display()
            ))
        })?;
        if !canonical.is_dir() {
            return Err(StorageError::Config(format!(
                "export root {} is not a directory",
                canonical.display()
            )));
        }
        Ok(Self { root: canonical })
    }

    /// Canonical root path.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve a raw (still percent-encoded) path below `/exports/`.
    ///
    /// This is an async wrapper around [`ExportRoot::resolve_sync`] that uses
    /// `spawn_blocking` so `canonicalize` and `stat` never block the runtime.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn resolve(&self, raw_path: &str) -> StorageResult<ResolvedArtifact> {
        let root = self.clone();
        let raw = raw_path.to_string();
        let result = tokio::task::spawn_blocking(move || root.resolve_sync(&raw))
            .await
            .map_err(StorageError::join)?;

        if let Err(StorageError::Traversal(reason)) = &result {
            warn!(security = "path_traversal", raw_path, reason = %reason, "blocked export path");
        }
        result
    }

    /// Synchronous path validation with traversal protection.
    ///
    /// Lexical checks run before any filesystem access, so a traversal
    /// attempt is rejected whether or not its target exists.
    pub fn resolve_sync(&self, raw_path: &str) -> StorageResult<ResolvedArtifact> {
        let decoded = percent_decode_str(raw_path)
            .decode_utf8()
            .map_err(|_| StorageError::InvalidPath("path is not valid UTF-8".to_string()))?;

        check_lexical(&decoded)?;

        let (kind, archive) = ArtifactKind::split(&decoded)
            .ok_or_else(|| StorageError::NotFound(decoded.to_string()))?;

        let joined = self.root.join(archive);
        let meta = std::fs::symlink_metadata(&joined).map_err(|e| not_found_or_io(e, archive))?;

        let canonical = joined.canonicalize().map_err(|e| {
            if meta.file_type().is_symlink() {
                // Dangling link.
                StorageError::NotFound(archive.to_string())
            } else {
                not_found_or_io(e, archive)
            }
        })?;

        if canonical == self.root || !canonical.starts_with(&self.root) {
            return Err(StorageError::Traversal(format!(
                "resolved path escapes export root: {archive}"
            )));
        }

        let target = std::fs::metadata(&canonical).map_err(|e| not_found_or_io(e, archive))?;
        if !target.is_file() {
            return Err(StorageError::NotFound(archive.to_string()));
        }

        Ok(ResolvedArtifact {
            kind,
            relative_path: archive.to_string(),
            path: canonical,
        })
    }

    /// Verify the root is still a readable directory.
    pub async fn health_check(&self) -> StorageResult<()> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let meta = std::fs::metadata(&root)?;
            if !meta.is_dir() {
                return Err(StorageError::Config(format!(
                    "{} is no longer a directory",
                    root.display()
                )));
            }
            std::fs::read_dir(&root)?;
            Ok(())
        })
        .await
        .map_err(StorageError::join)?
    }
}

fn check_lexical(decoded: &str) -> StorageResult<()> {
    if decoded.is_empty() {
        return Err(StorageError::NotFound(String::new()));
    }
    if decoded.starts_with('/') || decoded.contains('\\') {
        return Err(StorageError::Traversal(format!(
            "absolute path or backslash: {decoded}"
        )));
    }

    for segment in decoded.split('/') {
        if segment == ".." {
            return Err(StorageError::Traversal(format!(
                "parent directory segment: {decoded}"
            )));
        }
        if segment.is_empty() || segment == "." {
            return Err(StorageError::InvalidPath(format!(
                "empty or current-directory segment: {decoded}"
            )));
        }
        if segment.chars().any(char::is_control) {
            return Err(StorageError::InvalidPath(
                "control character in path".to_string(),
            ));
        }
    }

    // Platform-specific prefixes (e.g. drive letters) show up as non-normal components.
    if !Path::new(decoded)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::Traversal(format!(
            "contains unsafe path component: {decoded}"
        )));
    }
    Ok(())
}

fn not_found_or_io(err: std::io::Error, what: &str) -> StorageError {
    match err.kind() {
        ErrorKind::NotFound | ErrorKind::NotADirectory => StorageError::NotFound(what.to_string()),
        _ => StorageError::Io(err),
    }
}
