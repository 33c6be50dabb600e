//! Routing error taxonomy and the HTTP rejections it is translated into

use serde::Serialize;
use thiserror::Error;

/// Errors produced while resolving or reaching a backend
#[derive(Debug, Error)]
pub enum RouteError {
    /// Unknown container or hostname
    #[error("no container for {0}")]
    NotFound(String),

    /// The resource exists but the requested protocol or ingress port is closed for it
    #[error("{protocol} is not enabled for container {container_id}")]
    ProtocolBlocked {
        container_id: String,
        protocol: &'static str,
    },

    /// No static route matches the host and path
    #[error("no static route for {host}{path}")]
    NoRoute { host: String, path: String },

    /// The backing store could not be read or written
    #[error("route store unavailable: {0}")]
    StoreUnavailable(String),

    /// Dial to a resolved target failed
    #[error("backend {addr} unreachable: {reason}")]
    BackendUnreachable { addr: String, reason: String },

    /// Header parse failure or oversized header block
    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl RouteError {
    pub fn no_route(host: &str, path: &str) -> Self {
        RouteError::NoRoute {
            host: host.to_string(),
            path: path.to_string(),
        }
    }

    pub fn blocked(container_id: &str, protocol: &'static str) -> Self {
        RouteError::ProtocolBlocked {
            container_id: container_id.to_string(),
            protocol,
        }
    }

    /// Whether a resolver chain may fall through to the next strategy
    pub fn is_miss(&self) -> bool {
        matches!(self, RouteError::NotFound(_) | RouteError::NoRoute { .. })
    }

    pub fn code(&self) -> ProxyErrorCode {
        match self {
            RouteError::NotFound(_) => ProxyErrorCode::UnknownHost,
            RouteError::ProtocolBlocked { .. } => ProxyErrorCode::ProtocolBlocked,
            RouteError::NoRoute { .. } => ProxyErrorCode::NoRoute,
            RouteError::StoreUnavailable(_) => ProxyErrorCode::InternalError,
            RouteError::BackendUnreachable { .. } => ProxyErrorCode::ConnectionFailed,
            RouteError::MalformedRequest(_) => ProxyErrorCode::MalformedRequest,
        }
    }
}

/// Error codes for gateway rejections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Request head could not be parsed
    MalformedRequest,
    /// Request head exceeded the configured byte cap
    HeaderTooLarge,
    /// Unknown or unconfigured host
    UnknownHost,
    /// Protocol or ingress port disabled for the target
    ProtocolBlocked,
    /// No route claims the request
    NoRoute,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Internal gateway error
    InternalError,
}

impl ProxyErrorCode {
    /// Default HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyErrorCode::MissingHostHeader => 400,
            ProxyErrorCode::MalformedRequest => 400,
            ProxyErrorCode::HeaderTooLarge => 431,
            ProxyErrorCode::UnknownHost => 502,
            ProxyErrorCode::ProtocolBlocked => 502,
            ProxyErrorCode::NoRoute => 502,
            ProxyErrorCode::ConnectionFailed => 502,
            ProxyErrorCode::InternalError => 500,
        }
    }

    /// Error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::MalformedRequest => "MALFORMED_REQUEST",
            ProxyErrorCode::HeaderTooLarge => "HEADER_TOO_LARGE",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::ProtocolBlocked => "PROTOCOL_BLOCKED",
            ProxyErrorCode::NoRoute => "NO_ROUTE",
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
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code(),
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

/// Render a complete HTTP/1.1 error response. The connection is always closed
/// afterwards and the response must never be cached downstream.
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Vec<u8> {
    let status = code.status_code();
    let body = ErrorResponse::new(code, message).to_json();

    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         X-Proxy-Error: {}\r\n\
         Cache-Control: no-store\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        crate::http1::reason_phrase(status),
        body.len(),
        code.as_header_value(),
        body
    )
    .into_bytes()
}
