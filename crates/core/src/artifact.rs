//! Artifact model and route kinds.

use crate::conditional::truncate_to_seconds;
use crate::hash::ContentHash;
use std::time::SystemTime;

/// Suffix of a primary artifact.
pub const ARCHIVE_SUFFIX: &str = ".zip";

/// Suffix of a digest manifest route (appended to the archive name).
pub const MANIFEST_SUFFIX: &str = ".sha256";

/// Which representation of an artifact a request asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// The zip bundle itself (`*.zip`).
    Archive,
    /// A synthesized checksum manifest (`*.zip.sha256`).
    DigestManifest,
}

impl ArtifactKind {
    /// Split a relative request path into its kind and the archive path it maps to.
    ///
    /// `builds/app.zip.sha256` maps to `(DigestManifest, "builds/app.zip")`.
    /// Returns `None` when the path names neither route kind, or when the
    /// archive file name has nothing before the `.zip` suffix.
    pub fn split(relative_path: &str) -> Option<(Self, &str)> {
        let (kind, archive) = match relative_path.strip_suffix(MANIFEST_SUFFIX) {
            Some(archive) => (Self::DigestManifest, archive),
            None => (Self::Archive, relative_path),
        };

        let file_name = archive.rsplit('/').next().unwrap_or(archive);
        let stem = file_name.strip_suffix(ARCHIVE_SUFFIX)?;
        if stem.is_empty() {
            return None;
        }
        Some((kind, archive))
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::DigestManifest => "digest_manifest",
        }
    }
}

/// An immutable build artifact as observed on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    /// Path of the archive relative to the export root (`/`-separated).
    pub relative_path: String,
    /// Size of the archive in bytes.
    pub size_bytes: u64,
    /// Filesystem modification time.
    pub modified_at: SystemTime,
    /// SHA-256 of the archive content.
    pub content_digest: ContentHash,
}

impl Artifact {
    /// Final path segment of the archive, e.g. `app.zip`.
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }

    /// Entity tag for the given representation.
    ///
    /// The archive uses the quoted hex digest. The manifest tag carries a
    /// `-sha256` suffix so both routes are cached independently.
    pub fn etag(&self, kind: ArtifactKind) -> String {
        match kind {
            ArtifactKind::Archive => self.content_digest.strong_etag(),
            ArtifactKind::DigestManifest => format!("\"{}-sha256\"", self.content_digest.to_hex()),
        }
    }

    /// Body of the digest manifest in conventional checksum-tool format.
    pub fn manifest_body(&self) -> String {
        format!("{}  {}\n", self.content_digest.to_hex(), self.file_name())
    }

    /// `Last-Modified` header value (whole seconds, IMF-fixdate).
    ///
    /// Modification times outside 1970..=9999 are clamped to that range.
    pub fn last_modified(&self) -> String {
        httpdate::fmt_http_date(truncate_to_seconds(self.modified_at))
    }
}
