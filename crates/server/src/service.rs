//! The protocol-neutral gateway service.
//!
//! [`GatewayService::handle`] takes a parsed request and returns a
//! response; it knows nothing about sockets or axum. Every request, whether
//! served or rejected, is metered and audited exactly once.

use crate::audit::{AuditEvent, AuditRecord, AuditSink, AuditTrail, FileAuditSink, now_rfc3339};
use crate::auth::{AuthGuard, Authorization};
use crate::error::{ApiError, ApiResult, StartupError};
use crate::metrics::{METRICS_CONTENT_TYPE, MetricsRecorder};
use crate::ratelimit::{RateLimiter, TrustedProxies};
use crate::responder::ArtifactResponder;
use bytes::Bytes;
use exgate_core::{AppConfig, ArtifactKind, Freshness, RequestValidators, RouteClass};
use exgate_storage::{ByteStream, DigestCache, ExportRoot, ResolvedArtifact, open_matching};
use http::header::{self, HeaderName};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Gateway version reported by `/healthz` and `X-Exgate-Version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Response header carrying [`VERSION`].
pub const VERSION_HEADER: HeaderName = HeaderName::from_static("x-exgate-version");

/// Times an archive is re-hashed when it changes between hashing and opening.
const MAX_OPEN_ATTEMPTS: usize = 3;

/// An inbound request, independent of the HTTP server in use.
#[derive(Clone, Debug)]
pub struct GatewayRequest {
    pub method: Method,
    /// Raw, still percent-encoded URI path without the query string.
    pub path: String,
    pub headers: HeaderMap,
    /// Address of the connecting peer, when known.
    pub peer_addr: Option<IpAddr>,
    pub trace_id: Option<String>,
}

impl GatewayRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            peer_addr: None,
            trace_id: None,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_peer(mut self, peer: IpAddr) -> Self {
        self.peer_addr = Some(peer);
        self
    }

    fn header_str(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Response body.
pub enum ResponseBody {
    Empty,
    Full(Bytes),
    /// Streamed archive content.
    Stream(ByteStream),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// A response produced by [`GatewayService::handle`].
#[derive(Debug)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl GatewayResponse {
    /// Body bytes this response sends. Streams count their advertised length.
    pub fn body_len(&self) -> u64 {
        match &self.body {
            ResponseBody::Empty => 0,
            ResponseBody::Full(bytes) => bytes.len() as u64,
            ResponseBody::Stream(_) => self
                .headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route<'a> {
    Exports(&'a str),
    Health,
    Metrics,
}

impl Route<'_> {
    fn class(&self) -> RouteClass {
        match self {
            Self::Exports(_) => RouteClass::Exports,
            Self::Health => RouteClass::Health,
            Self::Metrics => RouteClass::Metrics,
        }
    }

    fn allow(&self) -> &'static str {
        match self {
            Self::Metrics => "GET",
            _ => "GET, HEAD",
        }
    }

    fn permits(&self, method: &Method) -> bool {
        match self {
            Self::Metrics => method == Method::GET,
            _ => method == Method::GET || method == Method::HEAD,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// The export artifact gateway. Constructed once at startup and shared.
pub struct GatewayService {
    config: AppConfig,
    export_root: ExportRoot,
    digests: DigestCache,
    responder: ArtifactResponder,
    auth: AuthGuard,
    rate_limiter: RateLimiter,
    proxies: TrustedProxies,
    audit: AuditTrail,
    metrics: MetricsRecorder,
}

impl GatewayService {
    /// Validate `config` and build the service with a file audit sink.
    /// Must be called within a Tokio runtime.
    pub fn new(config: AppConfig) -> Result<Self, StartupError> {
        let sink = Arc::new(FileAuditSink::new(
            config.audit.path.clone(),
            config.audit.rotation,
        ));
        Self::with_audit_sink(config, sink)
    }

    /// Like [`GatewayService::new`] with a caller-supplied audit sink.
    pub fn with_audit_sink(
        config: AppConfig,
        sink: Arc<dyn AuditSink>,
    ) -> Result<Self, StartupError> {
        for warning in config.validate()? {
            warn!("config: {warning}");
        }

        let export_root = ExportRoot::open(&config.exports.root)?;
        let metrics = MetricsRecorder::new()?;
        let audit = AuditTrail::new(&config.audit, sink, metrics.audit_dropped_counter())?;

        info!(
            root = %export_root.path().display(),
            cache_control = config.exports.cache_control.as_str(),
            rate_limit = config.rate_limit.enabled,
            audit = audit.is_enabled(),
            "gateway service ready"
        );

        Ok(Self {
            digests: DigestCache::new(config.exports.digest_chunk_size),
            responder: ArtifactResponder::new(
                config.exports.cache_control,
                config.exports.digest_chunk_size,
            ),
            auth: AuthGuard::new(&config.auth)?,
            rate_limiter: RateLimiter::new(&config.rate_limit),
            proxies: TrustedProxies::from_config(&config.rate_limit.trusted_proxies),
            export_root,
            audit,
            metrics,
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn export_root(&self) -> &ExportRoot {
        &self.export_root
    }

    pub fn digests(&self) -> &DigestCache {
        &self.digests
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    /// Handle one request.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        let started = Instant::now();
        let is_head = request.method == Method::HEAD;
        let mut identity = self
            .proxies
            .client_identity(&request.headers, request.peer_addr);

        let (mut response, event) = match self.dispatch(&request, &mut identity).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let event = err.audit_event();
                debug!(code = err.code(), "request rejected");
                (err.into_gateway_response(is_head), event)
            }
        };

        if is_head {
            response.body = ResponseBody::Empty;
        }
        if self.config.server.version_header {
            response
                .headers
                .insert(VERSION_HEADER, HeaderValue::from_static(VERSION));
        }

        let elapsed = started.elapsed();
        let content_length = response.body_len();
        self.metrics
            .observe(response.status.as_u16(), elapsed.as_secs_f64(), content_length);
        self.audit.append(AuditRecord {
            timestamp: now_rfc3339(),
            method: request.method.to_string(),
            path: request.path,
            status: response.status.as_u16(),
            identity,
            content_length,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            event,
            trace_id: request.trace_id,
        });

        response
    }

    async fn dispatch(
        &self,
        request: &GatewayRequest,
        identity: &mut String,
    ) -> ApiResult<(GatewayResponse, AuditEvent)> {
        let route = self.route(&request.path)?;
        if !route.permits(&request.method) {
            return Err(ApiError::MethodNotAllowed {
                allow: route.allow(),
            });
        }

        match self.auth.authorize(&request.headers, route.class()) {
            Authorization::Authenticated(principal) => *identity = principal.identity,
            Authorization::Anonymous => {}
            Authorization::Denied => return Err(ApiError::Unauthorized),
        }

        self.rate_limiter.check(route.class(), identity, 1)?;

        match route {
            Route::Exports(raw) => {
                let resolved = self.export_root.resolve(raw).await?;
                self.serve_artifact(&resolved, request).await
            }
            Route::Health => self.health().await,
            Route::Metrics => self.metrics_response(),
        }
    }

    fn route<'a>(&self, path: &'a str) -> ApiResult<Route<'a>> {
        match path {
            "/healthz" => Ok(Route::Health),
            "/metrics" if self.config.server.metrics_enabled => Ok(Route::Metrics),
            _ => path
                .strip_prefix("/exports/")
                .map(Route::Exports)
                .ok_or(ApiError::NotFound),
        }
    }

    async fn serve_artifact(
        &self,
        resolved: &ResolvedArtifact,
        request: &GatewayRequest,
    ) -> ApiResult<(GatewayResponse, AuditEvent)> {
        let validators = RequestValidators {
            if_none_match: request.header_str(header::IF_NONE_MATCH),
            if_modified_since: request.header_str(header::IF_MODIFIED_SINCE),
        };

        for attempt in 1..=MAX_OPEN_ATTEMPTS {
            let lookup = self.digests.digest_for(&resolved.path).await?;
            self.metrics.record_digest_lookup(lookup.cache_hit);

            let artifact = lookup.entry.artifact(resolved.relative_path.clone());
            let etag = artifact.etag(resolved.kind);
            if validators.evaluate(&etag, artifact.modified_at) == Freshness::NotModified {
                return Ok((
                    self.responder.not_modified(&artifact, resolved.kind),
                    AuditEvent::NotModified,
                ));
            }

            match resolved.kind {
                ArtifactKind::DigestManifest => {
                    return Ok((self.responder.manifest(&artifact), AuditEvent::Served));
                }
                ArtifactKind::Archive if request.method == Method::HEAD => {
                    return Ok((self.responder.archive(&artifact, None), AuditEvent::Served));
                }
                ArtifactKind::Archive => {
                    if let Some(file) = open_matching(&resolved.path, &lookup.entry).await? {
                        return Ok((
                            self.responder.archive(&artifact, Some(file)),
                            AuditEvent::Served,
                        ));
                    }
                    debug!(attempt, "archive changed after hashing, recomputing digest");
                    self.digests.invalidate(&resolved.path);
                }
            }
        }

        Err(ApiError::Internal(format!(
            "{} kept changing while being opened",
            resolved.relative_path
        )))
    }

    async fn health(&self) -> ApiResult<(GatewayResponse, AuditEvent)> {
        self.export_root
            .health_check()
            .await
            .map_err(|e| ApiError::Internal(format!("export root unavailable: {e}")))?;

        let body = serde_json::to_vec(&HealthResponse {
            status: "ok",
            version: VERSION,
        })
        .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok((
            full_response("application/json", body),
            AuditEvent::Health,
        ))
    }

    fn metrics_response(&self) -> ApiResult<(GatewayResponse, AuditEvent)> {
        let body = self
            .metrics
            .encode()
            .map_err(|e| ApiError::Internal(format!("failed to encode metrics: {e}")))?;
        Ok((
            full_response(METRICS_CONTENT_TYPE, body),
            AuditEvent::Metrics,
        ))
    }
}

impl fmt::Debug for GatewayService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayService")
            .field("export_root", &self.export_root.path())
            .field("auth", &self.auth)
            .field("rate_limit", &self.rate_limiter.is_enabled())
            .field("audit", &self.audit.is_enabled())
            .finish()
    }
}

fn full_response(content_type: &'static str, body: Vec<u8>) -> GatewayResponse {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    GatewayResponse {
        status: StatusCode::OK,
        headers,
        body: ResponseBody::Full(Bytes::from(body)),
    }
}
