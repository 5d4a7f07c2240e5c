//! Error taxonomy and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::caddy::ProxyError;
use crate::runtime::RuntimeError;

/// Errors surfaced by the registry and the orchestrator
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid service definition: {0}")]
    InvalidSpec(String),

    #[error("failed to start service '{name}': {reason}")]
    ServiceStartError { name: String, reason: String },

    #[error("failed to stop service '{name}': {reason}")]
    ServiceStopError { name: String, reason: String },

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("container runtime error: {0}")]
    RuntimeFailure(String),

    #[error("container no longer exists: {0}")]
    ContainerGone(String),

    #[error("route sync failed: {0}")]
    ProxySyncError(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

/// Result alias used across the core
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the failure is the container engine being unreachable rather
    /// than a problem with the service itself
    pub fn is_runtime_unavailable(&self) -> bool {
        matches!(self, Error::RuntimeUnavailable(_))
    }
}

impl From<RuntimeError> for Error {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(msg) => Error::RuntimeUnavailable(msg),
            RuntimeError::NotFound(msg) => Error::ContainerGone(msg),
            RuntimeError::Failed(msg) => Error::RuntimeFailure(msg),
        }
    }
}

impl From<ProxyError> for Error {
    fn from(err: ProxyError) -> Self {
        Error::ProxySyncError(err.to_string())
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Unknown or unconfigured host
    UnknownHost,
    /// Service could not be woken
    ServiceUnavailable,
    /// Upstream did not answer in time
    RequestTimeout,
    /// Failed to connect to the upstream
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
