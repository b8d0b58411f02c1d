//! Response construction for artifact and manifest routes.

use crate::service::{GatewayResponse, ResponseBody};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use bytes::Bytes;
use exgate_core::{Artifact, ArtifactKind, CacheControlPolicy};
use exgate_storage::chunked_stream;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::fs::File;

/// RFC 5987 `attr-char`: everything else in `filename*` is percent-encoded.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

const ZIP_CONTENT_TYPE: &str = "application/zip";
const MANIFEST_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Builds 200 and 304 responses with consistent caching headers.
#[derive(Clone, Debug)]
pub struct ArtifactResponder {
    cache_control: CacheControlPolicy,
    chunk_size: usize,
}

impl ArtifactResponder {
    pub fn new(cache_control: CacheControlPolicy, chunk_size: usize) -> Self {
        Self {
            cache_control,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Archive response. `file` is `None` for HEAD, which gets the full
    /// header set with an empty body.
    ///
    /// Range requests are not supported; the full archive is always sent.
    pub fn archive(&self, artifact: &Artifact, file: Option<File>) -> GatewayResponse {
        let mut headers = self.validator_headers(artifact, ArtifactKind::Archive);
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(ZIP_CONTENT_TYPE),
        );
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from(artifact.size_bytes),
        );
        if let Ok(value) = HeaderValue::from_str(&content_disposition(artifact.file_name())) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

        let body = match file {
            Some(file) => {
                ResponseBody::Stream(chunked_stream(file, artifact.size_bytes, self.chunk_size))
            }
            None => ResponseBody::Empty,
        };
        GatewayResponse {
            status: StatusCode::OK,
            headers,
            body,
        }
    }

    /// Digest manifest response: `<hex>  <file name>\n`.
    pub fn manifest(&self, artifact: &Artifact) -> GatewayResponse {
        let body = artifact.manifest_body();
        let mut headers = self.validator_headers(artifact, ArtifactKind::DigestManifest);
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(MANIFEST_CONTENT_TYPE),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        GatewayResponse {
            status: StatusCode::OK,
            headers,
            body: ResponseBody::Full(Bytes::from(body)),
        }
    }

    /// 304 carrying only the validators and caching headers.
    pub fn not_modified(&self, artifact: &Artifact, kind: ArtifactKind) -> GatewayResponse {
        GatewayResponse {
            status: StatusCode::NOT_MODIFIED,
            headers: self.validator_headers(artifact, kind),
            body: ResponseBody::Empty,
        }
    }

    fn validator_headers(&self, artifact: &Artifact, kind: ArtifactKind) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(etag) = HeaderValue::from_str(&artifact.etag(kind)) {
            headers.insert(header::ETAG, etag);
        }
        if let Ok(modified) = HeaderValue::from_str(&artifact.last_modified()) {
            headers.insert(header::LAST_MODIFIED, modified);
        }
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(self.cache_control.header_value()),
        );
        headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
        headers
    }
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987
/// `filename*` for the exact name.
pub fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() {
                c
            } else {
                '_'
            }
        })
        .collect();
    let fallback = fallback.replace('\\', "\\\\").replace('"', "\\\"");
    let encoded = utf8_percent_encode(file_name, ATTR_CHAR);
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}
