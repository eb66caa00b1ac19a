//! Error taxonomy for the orchestrator and JSON error responses for the proxy

use crate::bus::BusError;
use crate::registry::InstanceStatus;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors produced while creating, routing to, or tearing down an instance.
///
/// Every variant is scoped to a single app id; none of them is fatal to the
/// host process.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("app {0} already exists")]
    AlreadyExists(String),

    #[error("no free backend port in {start}..{end}")]
    PortExhausted { start: u16, end: u32 },

    #[error("cannot build backend: {0}")]
    ContentError(String),

    #[error("app {0} not found or expired")]
    NotFound(String),

    #[error("backend for app {id} unavailable: {reason}")]
    BackendUnavailable { id: String, reason: String },

    #[error("instance limit of {limit} reached")]
    CapacityExceeded { limit: usize },

    #[error("invalid app id: {0:?}")]
    InvalidId(String),

    #[error("app {id}: invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        id: String,
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error("backend for app {id} did not stop cleanly: {reason}")]
    BackendStop { id: String, reason: String },

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl OrchestratorError {
    /// Stable machine-readable code, used in logs, notices and API bodies
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::AlreadyExists(_) => "ALREADY_EXISTS",
            OrchestratorError::PortExhausted { .. } => "PORT_EXHAUSTED",
            OrchestratorError::ContentError(_) => "CONTENT_ERROR",
            OrchestratorError::NotFound(_) => "NOT_FOUND",
            OrchestratorError::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            OrchestratorError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            OrchestratorError::InvalidId(_) => "INVALID_ID",
            OrchestratorError::InvalidTransition { .. } => "INVALID_TRANSITION",
            OrchestratorError::BackendStop { .. } => "BACKEND_STOP",
            OrchestratorError::Bus(_) => "BUS_ERROR",
        }
    }

    /// HTTP status used when the error is reported over the admin API
    pub fn status_code(&self) -> StatusCode {
        match self {
            OrchestratorError::AlreadyExists(_) => StatusCode::CONFLICT,
            OrchestratorError::PortExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::ContentError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::BackendUnavailable { .. } => StatusCode::BAD_GATEWAY,
            OrchestratorError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            OrchestratorError::InvalidId(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::InvalidTransition { .. } => StatusCode::CONFLICT,
            OrchestratorError::BackendStop { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Bus(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Path does not name a preview app, or the app is unknown, expired or failed
    AppNotFound,
    /// App is still being created
    AppNotReady,
    /// Backend refused the connection or did not answer in time
    BackendUnavailable,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::AppNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::AppNotReady => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BackendUnavailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::AppNotFound => "APP_NOT_FOUND",
            ProxyErrorCode::AppNotReady => "APP_NOT_READY",
            ProxyErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
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

    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value());

    // Instance is still binding, clients should come back shortly
    if matches!(code, ProxyErrorCode::AppNotReady) {
        builder = builder.header("Retry-After", "1");
    }

    builder
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
