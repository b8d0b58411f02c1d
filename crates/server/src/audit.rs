//! Signed, append-only audit trail.
//!
//! Every request produces one [`AuditRecord`]. Records are queued without
//! blocking the request and written as JSON lines by a background task. A
//! full queue drops the record (counted in `audit_records_dropped_total`)
//! and a failing sink is logged; neither ever affects the HTTP response.

use async_trait::async_trait;
use exgate_core::config::{AuditConfig, AuditRotation};
use exgate_signer::{AuditSigner, SIGNATURE_FIELD, SignerError};
use prometheus::IntCounter;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc, oneshot};

/// Replacement value for redacted fields.
pub const REDACTED: &str = "[redacted]";

/// What happened to a request, from the audit trail's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Served,
    NotModified,
    Health,
    Metrics,
    BadRequest,
    Unauthorized,
    /// A path tried to escape the export root.
    TraversalBlocked,
    NotFound,
    MethodNotAllowed,
    RateLimited,
    InternalError,
}

impl AuditEvent {
    /// Get the string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Served => "served",
            Self::NotModified => "not_modified",
            Self::Health => "health",
            Self::Metrics => "metrics",
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::TraversalBlocked => "traversal_blocked",
            Self::NotFound => "not_found",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::RateLimited => "rate_limited",
            Self::InternalError => "internal_error",
        }
    }
}

/// One audited request.
#[derive(Clone, Debug, Serialize)]
pub struct AuditRecord {
    /// RFC 3339 UTC time the request completed.
    pub timestamp: String,
    pub method: String,
    /// Raw request path, as received.
    pub path: String,
    pub status: u16,
    /// `key:<fingerprint>` or `ip:<address>`; never a raw credential.
    pub identity: String,
    /// Body bytes sent (0 for HEAD, 304 and empty error bodies).
    pub content_length: u64,
    pub duration_ms: u64,
    pub event: AuditEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl AuditRecord {
    /// Field map as written, before redaction and signing.
    pub fn to_fields(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Ok(Map::from_iter([("record".to_string(), other)])),
        }
    }
}

/// Current UTC time as RFC 3339.
pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/// Destination for rendered audit lines.
#[async_trait]
pub trait AuditSink: Send + Sync + 'static {
    /// Append one line (without trailing newline).
    async fn write_line(&self, line: &str) -> std::io::Result<()>;

    /// Make previously written lines durable.
    async fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// File path for a record written on `date`.
///
/// With daily rotation `audit/audit.jsonl` becomes
/// `audit/audit-2023-11-14.jsonl`.
pub fn rotated_path(base: &Path, rotation: AuditRotation, date: time::Date) -> PathBuf {
    match rotation {
        AuditRotation::None => base.to_path_buf(),
        AuditRotation::Daily => {
            let stem = base
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "audit".to_string());
            let day = format!(
                "{:04}-{:02}-{:02}",
                date.year(),
                u8::from(date.month()),
                date.day()
            );
            let name = match base.extension() {
                Some(ext) => format!("{stem}-{day}.{}", ext.to_string_lossy()),
                None => format!("{stem}-{day}"),
            };
            base.with_file_name(name)
        }
    }
}

/// Append-only JSON-lines file sink.
pub struct FileAuditSink {
    base: PathBuf,
    rotation: AuditRotation,
    current: Mutex<Option<(PathBuf, tokio::fs::File)>>,
}

impl FileAuditSink {
    pub fn new(base: impl Into<PathBuf>, rotation: AuditRotation) -> Self {
        Self {
            base: base.into(),
            rotation,
            current: Mutex::new(None),
        }
    }

    /// Path the next record would be written to.
    pub fn current_path(&self) -> PathBuf {
        rotated_path(&self.base, self.rotation, OffsetDateTime::now_utc().date())
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let target = self.current_path();
        let mut current = self.current.lock().await;

        let reopen = !matches!(&*current, Some((path, _)) if *path == target);
        if reopen {
            if let Some(parent) = target.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)
                .await?;
            *current = Some((target, file));
        }

        if let Some((_, file)) = current.as_mut() {
            let mut buf = Vec::with_capacity(line.len() + 1);
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
            file.write_all(&buf).await?;
            file.flush().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> std::io::Result<()> {
        if let Some((_, file)) = self.current.lock().await.as_mut() {
            file.sync_data().await?;
        }
        Ok(())
    }
}

/// Turns records into signed, redacted JSON lines.
#[derive(Clone, Debug)]
pub struct AuditRenderer {
    signer: Option<AuditSigner>,
    redact_fields: Vec<String>,
}

impl AuditRenderer {
    pub fn new(signer: Option<AuditSigner>, redact_fields: Vec<String>) -> Self {
        Self {
            signer,
            redact_fields,
        }
    }

    /// Render a record. Redaction is applied before signing, so the
    /// signature covers exactly what is stored.
    pub fn render(&self, record: &AuditRecord) -> Result<String, SignerError> {
        let mut fields = record
            .to_fields()
            .map_err(|e| SignerError::InvalidRecord(e.to_string()))?;

        for name in &self.redact_fields {
            if let Some(value) = fields.get_mut(name) {
                *value = Value::String(REDACTED.to_string());
            }
        }

        if let Some(signer) = &self.signer {
            let signature = signer.sign_fields(&fields)?;
            fields.insert(SIGNATURE_FIELD.to_string(), Value::String(signature));
        }

        serde_json::to_string(&Value::Object(fields))
            .map_err(|e| SignerError::InvalidRecord(e.to_string()))
    }
}

enum AuditCommand {
    Record(Box<AuditRecord>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the audit writer. Cheap to clone.
#[derive(Clone)]
pub struct AuditTrail {
    inner: Option<Arc<AuditTrailInner>>,
}

struct AuditTrailInner {
    tx: mpsc::Sender<AuditCommand>,
    dropped: IntCounter,
}

impl AuditTrail {
    /// Start the writer task for `sink`. Must be called within a Tokio runtime.
    pub fn new(
        config: &AuditConfig,
        sink: Arc<dyn AuditSink>,
        dropped: IntCounter,
    ) -> Result<Self, SignerError> {
        if !config.enabled {
            return Ok(Self::disabled());
        }

        let signer = config
            .signing_secret
            .as_deref()
            .map(AuditSigner::new)
            .transpose()?;
        let renderer = AuditRenderer::new(signer, config.redact_fields.clone());

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        tokio::spawn(run_writer(rx, sink, renderer));

        Ok(Self {
            inner: Some(Arc::new(AuditTrailInner { tx, dropped })),
        })
    }

    /// A trail that discards everything.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Queue a record. Never blocks and never fails the caller.
    pub fn append(&self, record: AuditRecord) {
        let Some(inner) = &self.inner else {
            return;
        };
        match inner.tx.try_send(AuditCommand::Record(Box::new(record))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                inner.dropped.inc();
                tracing::error!("audit queue full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                inner.dropped.inc();
                tracing::error!("audit writer stopped, dropping record");
            }
        }
    }

    /// Wait until every record queued before this call has been written.
    pub async fn flush(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if inner.tx.send(AuditCommand::Flush(done_tx)).await.is_err() {
            tracing::error!("audit writer stopped before flush");
            return;
        }
        let _ = done_rx.await;
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<AuditCommand>,
    sink: Arc<dyn AuditSink>,
    renderer: AuditRenderer,
) {
    while let Some(command) = rx.recv().await {
        match command {
            AuditCommand::Record(record) => match renderer.render(&record) {
                Ok(line) => {
                    if let Err(e) = sink.write_line(&line).await {
                        tracing::error!(error = %e, "failed to write audit record");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to render audit record");
                }
            },
            AuditCommand::Flush(done) => {
                if let Err(e) = sink.flush().await {
                    tracing::error!(error = %e, "failed to flush audit sink");
                }
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("audit writer stopped");
}
