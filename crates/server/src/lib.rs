//! HTTP gateway serving immutable export artifacts.
//!
//! This crate provides:
//! - [`GatewayService`], a protocol-neutral request handler
//! - API key authentication and per-identity rate limiting
//! - Strong validators and conditional responses for archives and digest manifests
//! - A signed, append-only audit trail and Prometheus metrics
//! - The axum binding used by the `exgated` binary

pub mod audit;
pub mod auth;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod responder;
pub mod routes;
pub mod service;

pub use audit::{AuditEvent, AuditRecord, AuditSink, AuditTrail, FileAuditSink};
pub use auth::{AuthGuard, TraceId};
pub use error::{ApiError, StartupError};
pub use metrics::MetricsRecorder;
pub use ratelimit::RateLimiter;
pub use responder::ArtifactResponder;
pub use routes::create_router;
pub use service::{GatewayRequest, GatewayResponse, GatewayService, ResponseBody};
