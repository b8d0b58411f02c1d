//! Gateway test utilities.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use bytes::Bytes;
use exgate_core::AppConfig;
use exgate_server::{AuditSink, GatewayService, create_router};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

/// API key accepted by [`AppConfig::for_testing`].
#[allow(dead_code)]
pub const TEST_API_KEY: &str = "test-api-key";

/// Audit sink that keeps lines in memory.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn records(&self) -> Vec<Value> {
        self.lines()
            .iter()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }
}

/// A response with its body collected.
#[allow(dead_code)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[allow(dead_code)]
impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A gateway over a temporary export root.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestGateway {
    pub router: axum::Router,
    pub service: Arc<GatewayService>,
    pub audit_sink: Arc<MemorySink>,
    root: TempDir,
}

#[allow(dead_code)]
impl TestGateway {
    /// Gateway with test defaults: rate limiting and audit disabled.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Gateway with custom config modifications. Call from within a Tokio runtime.
    pub fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let root = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = AppConfig::for_testing(root.path());
        modifier(&mut config);

        let audit_sink = Arc::new(MemorySink::default());
        let service = Arc::new(
            GatewayService::with_audit_sink(config, audit_sink.clone())
                .expect("Failed to create gateway service"),
        );
        let router = create_router(service.clone());

        Self {
            router,
            service,
            audit_sink,
            root,
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Write an artifact below the export root, creating parent directories.
    pub fn write_artifact(&self, relative_path: &str, data: &[u8]) -> PathBuf {
        let path = self.root.path().join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create artifact directory");
        }
        std::fs::write(&path, data).expect("Failed to write artifact");
        path
    }

    /// Send a raw request through the router.
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Send a request with the given headers.
    pub async fn request(&self, method: Method, uri: &str, headers: &[(&str, &str)]) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    /// Send a request as if it arrived from `peer`.
    pub async fn request_from(
        &self,
        peer: SocketAddr,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        self.send(request).await
    }

    /// Authenticated GET.
    pub async fn get(&self, uri: &str) -> TestResponse {
        self.request(Method::GET, uri, &[("x-api-key", TEST_API_KEY)])
            .await
    }

    /// Authenticated GET with extra headers.
    pub async fn get_with(&self, uri: &str, headers: &[(&str, &str)]) -> TestResponse {
        let mut all = vec![("x-api-key", TEST_API_KEY)];
        all.extend_from_slice(headers);
        self.request(Method::GET, uri, &all).await
    }

    /// Authenticated HEAD.
    pub async fn head(&self, uri: &str) -> TestResponse {
        self.request(Method::HEAD, uri, &[("x-api-key", TEST_API_KEY)])
            .await
    }

    /// Wait for queued audit records to reach the sink.
    pub async fn flush_audit(&self) {
        self.service.audit().flush().await;
    }
}
