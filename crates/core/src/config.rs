//! Configuration types shared across crates.
//!
//! Configuration is loaded once at startup, validated with
//! [`AppConfig::validate`], and treated as immutable afterwards.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// HTTP listener configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Emit an `X-Exgate-Version` header on every response.
    #[serde(default = "default_true")]
    pub version_header: bool,
    /// Serve the `/metrics` route (default: true).
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            version_header: true,
            metrics_enabled: true,
        }
    }
}

/// `Cache-Control` policy applied to artifact and manifest responses.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CacheControlPolicy {
    /// Clients may store but must revalidate before reuse.
    #[default]
    Revalidate,
    /// Content never changes under this URL; cache for a year.
    Immutable,
    /// Never store.
    NoStore,
}

impl CacheControlPolicy {
    /// Header value for this policy.
    pub fn header_value(self) -> &'static str {
        match self {
            Self::Revalidate => "no-cache",
            Self::Immutable => "public, max-age=31536000, immutable",
            Self::NoStore => "no-store",
        }
    }

    /// Get the string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Revalidate => "revalidate",
            Self::Immutable => "immutable",
            Self::NoStore => "no-store",
        }
    }
}

/// Export root configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportsConfig {
    /// Read-only directory holding the artifacts.
    pub root: PathBuf,
    /// Read size used for hashing and streaming, in bytes.
    #[serde(default = "default_digest_chunk_size")]
    pub digest_chunk_size: usize,
    /// Cache-Control policy for served artifacts.
    #[serde(default)]
    pub cache_control: CacheControlPolicy,
}

fn default_digest_chunk_size() -> usize {
    crate::DEFAULT_DIGEST_CHUNK_SIZE
}

impl ExportsConfig {
    /// Export configuration for a root with default settings.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            digest_chunk_size: default_digest_chunk_size(),
            cache_control: CacheControlPolicy::default(),
        }
    }
}

/// Shared-secret authentication configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// The shared secret callers must present.
    /// WARNING: Prefer EXGATE_AUTH__API_KEY over storing the key in a config file.
    pub api_key: String,
    /// Previously issued keys still accepted during a rotation window.
    #[serde(default)]
    pub rotated_api_keys: Vec<String>,
    /// Header carrying the credential (default: `x-api-key`).
    /// `Authorization: Bearer <key>` is accepted as well.
    #[serde(default = "default_header_name")]
    pub header_name: String,
    /// Serve `/healthz` without a credential (default: true).
    #[serde(default = "default_true")]
    pub health_public: bool,
}

fn default_header_name() -> String {
    "x-api-key".to_string()
}

impl AuthConfig {
    /// Auth configuration accepting a single key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            rotated_api_keys: Vec::new(),
            header_name: default_header_name(),
            health_public: true,
        }
    }

    /// All keys currently accepted, primary first.
    pub fn accepted_keys(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.api_key.as_str())
            .chain(self.rotated_api_keys.iter().map(String::as_str))
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("api_key", &"<redacted>")
            .field("rotated_api_keys", &self.rotated_api_keys.len())
            .field("header_name", &self.header_name)
            .field("health_public", &self.health_public)
            .finish()
    }
}

/// Route classes with independent rate limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteClass {
    /// `/exports/...` archive and manifest routes.
    Exports,
    /// `/healthz`.
    Health,
    /// `/metrics`.
    Metrics,
}

impl RouteClass {
    /// Get the string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exports => "exports",
            Self::Health => "health",
            Self::Metrics => "metrics",
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token bucket parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct BucketConfig {
    /// Maximum burst size in requests.
    pub capacity: u32,
    /// Tokens restored per second, continuously.
    pub refill_per_sec: f64,
}

impl BucketConfig {
    pub const fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    fn validate(&self, class: RouteClass) -> Result<(), String> {
        if self.capacity == 0 {
            return Err(format!("rate_limit.{class}.capacity must be at least 1"));
        }
        if !self.refill_per_sec.is_finite() || self.refill_per_sec <= 0.0 {
            return Err(format!(
                "rate_limit.{class}.refill_per_sec must be a positive number, got {}",
                self.refill_per_sec
            ));
        }
        Ok(())
    }
}

fn default_exports_bucket() -> BucketConfig {
    BucketConfig::new(60, 10.0)
}

fn default_health_bucket() -> BucketConfig {
    BucketConfig::new(30, 5.0)
}

fn default_metrics_bucket() -> BucketConfig {
    BucketConfig::new(10, 1.0)
}

/// Rate limiting configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Enable rate limiting (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bucket for artifact and manifest routes.
    #[serde(default = "default_exports_bucket")]
    pub exports: BucketConfig,
    /// Bucket for the health route.
    #[serde(default = "default_health_bucket")]
    pub health: BucketConfig,
    /// Bucket for the metrics route.
    #[serde(default = "default_metrics_bucket")]
    pub metrics: BucketConfig,
    /// Maximum number of tracked buckets, one per (identity, route class) pair (default: 100000).
    /// New identities beyond this are refused with 429 until cleanup runs.
    #[serde(default = "default_max_entries")]
    pub max_entries: u32,
    /// Interval in seconds between cleanup sweeps of idle buckets (default: 60).
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Buckets idle longer than this many seconds are evicted (default: 300).
    #[serde(default = "default_entry_ttl_secs")]
    pub entry_ttl_secs: u64,
    /// Trusted proxy IP addresses/CIDR ranges.
    /// Only requests from these peers have X-Forwarded-For/X-Real-IP honored.
    /// Use ["*"] to trust all proxies (NOT recommended for production).
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

fn default_max_entries() -> u32 {
    100_000
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_entry_ttl_secs() -> u64 {
    300
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exports: default_exports_bucket(),
            health: default_health_bucket(),
            metrics: default_metrics_bucket(),
            max_entries: default_max_entries(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            entry_ttl_secs: default_entry_ttl_secs(),
            trusted_proxies: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    /// Bucket parameters for a route class.
    pub fn bucket(&self, class: RouteClass) -> BucketConfig {
        match class {
            RouteClass::Exports => self.exports,
            RouteClass::Health => self.health,
            RouteClass::Metrics => self.metrics,
        }
    }

    /// Validate rate limit configuration.
    /// Returns warnings for settings that are insecure but allowed,
    /// and an error for settings that must be rejected.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        // Proxy trust also shapes audit identities, so it is checked even when
        // limiting is off.
        for entry in &self.trusted_proxies {
            if entry == "*" {
                continue;
            }
            let parsed = if entry.contains('/') {
                entry.parse::<IpNet>().map(|_| ()).map_err(|e| e.to_string())
            } else {
                entry.parse::<IpAddr>().map(|_| ()).map_err(|e| e.to_string())
            };
            if let Err(e) = parsed {
                return Err(format!(
                    "rate_limit.trusted_proxies entry '{entry}' is not an IP address \
                     or CIDR range: {e}"
                ));
            }
        }

        if !self.enabled {
            return Ok(warnings);
        }

        for class in [RouteClass::Exports, RouteClass::Health, RouteClass::Metrics] {
            self.bucket(class).validate(class)?;
        }

        if self.cleanup_interval_secs == 0 {
            return Err("rate_limit.cleanup_interval_secs cannot be 0. \
                 Use a value >= 1 second."
                .to_string());
        }

        if self.max_entries == 0 {
            return Err("rate_limit.max_entries must be at least 1".to_string());
        }

        if self.trusted_proxies.len() == 1 && self.trusted_proxies[0] == "*" {
            warnings.push(
                "rate_limit.trusted_proxies=['*'] trusts ALL forwarded headers. \
                 Clients can spoof their address and bypass per-address limits."
                    .to_string(),
            );
        }

        // A bucket evicted before it refills lets a client reset its limit by pausing.
        for class in [RouteClass::Exports, RouteClass::Health, RouteClass::Metrics] {
            let bucket = self.bucket(class);
            let full_refill_secs = f64::from(bucket.capacity) / bucket.refill_per_sec;
            if (self.entry_ttl_secs as f64) < full_refill_secs {
                warnings.push(format!(
                    "rate_limit.entry_ttl_secs={} is shorter than the {class} bucket's \
                     full refill time ({full_refill_secs:.0}s); idle clients may be evicted \
                     before their limit resets.",
                    self.entry_ttl_secs
                ));
            }
        }

        Ok(warnings)
    }
}

/// Audit sink file layout.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditRotation {
    /// One growing file at `path`.
    #[default]
    None,
    /// One file per UTC day: `<stem>-YYYY-MM-DD.<ext>` next to `path`.
    Daily,
}

/// Audit trail configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Write audit records (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sink path (JSON lines).
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
    /// File rotation.
    #[serde(default)]
    pub rotation: AuditRotation,
    /// HMAC-SHA256 key for record signatures. Records are unsigned when absent.
    /// WARNING: Prefer EXGATE_AUDIT__SIGNING_SECRET over storing it in a config file.
    #[serde(default)]
    pub signing_secret: Option<String>,
    /// Record fields whose values are masked before signing and writing.
    #[serde(default)]
    pub redact_fields: Vec<String>,
    /// Records buffered for the writer before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("./data/audit/audit.jsonl")
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_audit_path(),
            rotation: AuditRotation::default(),
            signing_secret: None,
            redact_fields: Vec::new(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl fmt::Debug for AuditConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditConfig")
            .field("enabled", &self.enabled)
            .field("path", &self.path)
            .field("rotation", &self.rotation)
            .field(
                "signing_secret",
                &self.signing_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("redact_fields", &self.redact_fields)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Export root configuration (required).
    pub exports: ExportsConfig,
    /// Authentication configuration (required).
    pub auth: AuthConfig,
    /// Rate limiting configuration.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Audit trail configuration.
    #[serde(default)]
    pub audit: AuditConfig,
}

impl AppConfig {
    /// Create a test configuration serving `root`.
    ///
    /// **For testing only.** Uses the key `test-api-key`, disables rate
    /// limiting and the audit trail.
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        Self {
            server: ServerConfig::default(),
            exports: ExportsConfig::new(root),
            auth: AuthConfig::new("test-api-key"),
            rate_limit: RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
            audit: AuditConfig {
                enabled: false,
                ..Default::default()
            },
        }
    }

    /// Validate the whole configuration.
    ///
    /// Returns warnings to log, or an error that must abort startup.
    /// A missing or unreadable export root is an error.
    pub fn validate(&self) -> crate::Result<Vec<String>> {
        let mut warnings = Vec::new();

        self.server
            .bind
            .parse::<SocketAddr>()
            .map_err(|e| invalid(format!("server.bind '{}': {e}", self.server.bind)))?;

        validate_export_root(&self.exports.root)?;

        let chunk = self.exports.digest_chunk_size;
        if !(crate::MIN_DIGEST_CHUNK_SIZE..=crate::MAX_DIGEST_CHUNK_SIZE).contains(&chunk) {
            return Err(invalid(format!(
                "exports.digest_chunk_size {chunk} must be between {} and {}",
                crate::MIN_DIGEST_CHUNK_SIZE,
                crate::MAX_DIGEST_CHUNK_SIZE
            )));
        }

        if self.auth.accepted_keys().any(|key| key.trim().is_empty()) {
            return Err(invalid("auth.api_key and rotated keys must not be empty"));
        }
        if self.auth.api_key.len() < 32 {
            warnings.push(
                "auth.api_key is shorter than 32 characters; use a long random secret".to_string(),
            );
        }
        let header = &self.auth.header_name;
        if header.is_empty()
            || !header
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(invalid(format!(
                "auth.header_name '{header}' is not a valid header name"
            )));
        }

        warnings.extend(self.rate_limit.validate().map_err(invalid)?);

        if self.audit.enabled {
            if self.audit.path.file_name().is_none() {
                return Err(invalid(format!(
                    "audit.path '{}' must name a file",
                    self.audit.path.display()
                )));
            }
            if self.audit.queue_capacity == 0 {
                return Err(invalid("audit.queue_capacity must be at least 1"));
            }
            match &self.audit.signing_secret {
                Some(secret) if secret.is_empty() => {
                    return Err(invalid("audit.signing_secret must not be empty when set"));
                }
                None => warnings.push(
                    "audit.signing_secret not set, audit records will be unsigned".to_string(),
                ),
                _ => {}
            }
        }

        Ok(warnings)
    }
}

fn invalid(message: impl Into<String>) -> crate::Error {
    crate::Error::InvalidConfig(message.into())
}

fn validate_export_root(root: &Path) -> crate::Result<()> {
    let meta = std::fs::metadata(root).map_err(|e| {
        crate::Error::ExportRootUnavailable(format!("{}: {e}", root.display()))
    })?;
    if !meta.is_dir() {
        return Err(crate::Error::ExportRootUnavailable(format!(
            "{} is not a directory",
            root.display()
        )));
    }
    std::fs::read_dir(root).map_err(|e| {
        crate::Error::ExportRootUnavailable(format!("{} is not readable: {e}", root.display()))
    })?;
    Ok(())
}
