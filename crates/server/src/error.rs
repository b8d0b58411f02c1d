//! API error types.

use crate::audit::AuditEvent;
use crate::ratelimit::{RateLimitError, RateLimitReason};
use crate::service::{GatewayResponse, ResponseBody};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use bytes::Bytes;
use exgate_storage::StorageError;
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
///
/// Messages never carry filesystem paths or internal detail; `Internal`
/// keeps its cause for the log only.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("method not allowed")]
    MethodNotAllowed { allow: &'static str },

    #[error("rate limited")]
    RateLimited(RateLimitError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::MethodNotAllowed { .. } => "method_not_allowed",
            Self::RateLimited(e) => match e.reason {
                RateLimitReason::RateLimited => "rate_limited",
                RateLimitReason::AtCapacity => "rate_limiter_at_capacity",
            },
            Self::Internal(_) => "internal_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The audit event recorded for a request that failed with this error.
    pub fn audit_event(&self) -> AuditEvent {
        match self {
            Self::NotFound => AuditEvent::NotFound,
            Self::BadRequest(_) => AuditEvent::BadRequest,
            Self::Unauthorized => AuditEvent::Unauthorized,
            Self::Forbidden => AuditEvent::TraversalBlocked,
            Self::MethodNotAllowed { .. } => AuditEvent::MethodNotAllowed,
            Self::RateLimited(_) => AuditEvent::RateLimited,
            Self::Internal(_) => AuditEvent::InternalError,
        }
    }

    /// Message safe to send to the client.
    fn public_message(&self) -> String {
        match self {
            Self::BadRequest(msg) => msg.clone(),
            Self::RateLimited(e) => match e.reason {
                RateLimitReason::RateLimited => "Too many requests".to_string(),
                RateLimitReason::AtCapacity => {
                    "Server is tracking too many clients, try again later".to_string()
                }
            },
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Build the JSON error response. HEAD requests get the same headers
    /// with an empty body.
    pub fn into_gateway_response(self, is_head: bool) -> GatewayResponse {
        if let Self::Internal(cause) = &self {
            tracing::error!(error = %cause, "request failed");
        }

        let status = self.status_code();
        let mut headers = HeaderMap::new();
        match &self {
            Self::Unauthorized => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("ApiKey realm=\"exgate\""),
                );
            }
            Self::MethodNotAllowed { allow } => {
                headers.insert(header::ALLOW, HeaderValue::from_static(*allow));
            }
            Self::RateLimited(e) => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(e.retry_after_secs));
            }
            _ => {}
        }
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.public_message(),
        };
        let json = serde_json::to_vec(&body).unwrap_or_default();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(json.len()));

        let body = if is_head {
            ResponseBody::Empty
        } else {
            ResponseBody::Full(Bytes::from(json))
        };
        GatewayResponse {
            status,
            headers,
            body,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => Self::NotFound,
            StorageError::Traversal(_) => Self::Forbidden,
            StorageError::InvalidPath(_) => Self::BadRequest("malformed artifact path".to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<RateLimitError> for ApiError {
    fn from(err: RateLimitError) -> Self {
        Self::RateLimited(err)
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Errors that stop the gateway from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] exgate_core::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("audit signer error: {0}")]
    Signer(#[from] exgate_signer::SignerError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("invalid header: {0}")]
    InvalidHeader(String),
}
