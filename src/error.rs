//! Gateway errors and their JSON HTTP representation

use crate::jsonrpc::JsonRpcError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Response body type used by every gateway handler
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Everything that can go wrong between a client request and a backend
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Server {0} not found in config")]
    ConfigNotFound(String),

    #[error("Server {0} is already running")]
    BackendAlreadyRunning(String),

    #[error("Failed to spawn server {name}: {reason}")]
    SpawnFailed { name: String, reason: String },

    #[error("Timeout waiting for response from {backend} to {method} after {}ms", .timeout.as_millis())]
    Timeout {
        backend: String,
        method: String,
        timeout: Duration,
    },

    #[error("Tool {0} not found")]
    ToolNotFound(String),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Transport error for {backend}: {reason}")]
    Transport { backend: String, reason: String },

    /// The backend answered with a JSON-RPC error object
    #[error("{}", .0.message)]
    Rpc(JsonRpcError),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Failed to load config: {0}")]
    Config(String),
}

impl GatewayError {
    pub fn transport(backend: &str, reason: impl Into<String>) -> Self {
        GatewayError::Transport {
            backend: backend.to_string(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::ConfigNotFound(_) => ErrorCode::ConfigNotFound,
            GatewayError::BackendAlreadyRunning(_) => ErrorCode::BackendAlreadyRunning,
            GatewayError::SpawnFailed { .. } => ErrorCode::BackendSpawnFailed,
            GatewayError::Timeout { .. } => ErrorCode::CorrelationTimeout,
            GatewayError::ToolNotFound(_) => ErrorCode::ToolNotFound,
            GatewayError::SessionNotFound => ErrorCode::SessionNotFound,
            GatewayError::Transport { .. } => ErrorCode::BackendTransportError,
            GatewayError::Rpc(_) => ErrorCode::BackendRpcError,
            GatewayError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            GatewayError::Config(_) => ErrorCode::InternalError,
        }
    }

    /// Render this error as a JSON HTTP response
    pub fn into_response(self) -> Response<GatewayBody> {
        let code = self.code();
        let data = match &self {
            GatewayError::Rpc(err) => Some(serde_json::json!({
                "code": err.code,
                "data": err.data,
            })),
            _ => None,
        };
        let mut body = ErrorResponse::new(code, self.to_string());
        body.rpc = data;
        body.into_response()
    }
}

/// Stable error codes reported in the `code` field of error bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Requested backend name is not in the configuration
    ConfigNotFound,
    /// A backend with this name is already registered
    BackendAlreadyRunning,
    /// The backend executable could not be spawned
    BackendSpawnFailed,
    /// No response within the correlation window
    CorrelationTimeout,
    /// No live backend reports the requested tool
    ToolNotFound,
    /// Message posted against an unknown session
    SessionNotFound,
    /// I/O failure on a backend connection
    BackendTransportError,
    /// Backend replied with a JSON-RPC error
    BackendRpcError,
    /// Malformed request payload or query
    InvalidMessage,
    /// No route for the request path
    NotFound,
    /// Anything else
    InternalError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ConfigNotFound => StatusCode::NOT_FOUND,
            ErrorCode::BackendAlreadyRunning => StatusCode::CONFLICT,
            ErrorCode::BackendSpawnFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::CorrelationTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::ToolNotFound => StatusCode::NOT_FOUND,
            ErrorCode::SessionNotFound => StatusCode::NOT_FOUND,
            ErrorCode::BackendTransportError => StatusCode::BAD_GATEWAY,
            ErrorCode::BackendRpcError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InvalidMessage => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigNotFound => "CONFIG_NOT_FOUND",
            ErrorCode::BackendAlreadyRunning => "BACKEND_ALREADY_RUNNING",
            ErrorCode::BackendSpawnFailed => "BACKEND_SPAWN_FAILED",
            ErrorCode::CorrelationTimeout => "CORRELATION_TIMEOUT",
            ErrorCode::ToolNotFound => "TOOL_NOT_FOUND",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::BackendTransportError => "BACKEND_TRANSPORT_ERROR",
            ErrorCode::BackendRpcError => "BACKEND_RPC_ERROR",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
    /// The error code
    pub code: ErrorCode,
    /// HTTP status code (for reference)
    pub status: u16,
    /// Backend JSON-RPC error details, relayed verbatim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            status: code.status_code().as_u16(),
            code,
            rpc: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","code":"{}","status":{}}}"#,
                self.error.replace('\"', "\\\""),
                self.code.as_str(),
                self.status
            )
        })
    }

    pub fn into_response(self) -> Response<GatewayBody> {
        json_body_response(self.code.status_code(), self.to_json())
    }
}

/// Create a JSON error response
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<GatewayBody> {
    ErrorResponse::new(code, message).into_response()
}

/// Create a JSON response with an arbitrary status
pub fn json_body_response(status: StatusCode, body: impl Into<Bytes>) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Wrap bytes into the boxed body type
pub fn full_body(body: impl Into<Bytes>) -> GatewayBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}
