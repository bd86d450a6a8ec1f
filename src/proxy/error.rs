// Error taxonomy for the session registry and forwarding engine

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;

/// Errors surfaced to callers of the registry / forwarding engine.
///
/// Non-2xx upstream responses are not errors; they are passed through to the
/// caller unchanged. Only connectivity-level faults become `UpstreamUnreachable`.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The referenced session id does not exist or was evicted.
    #[error("Session not found")]
    SessionNotFound,

    /// Malformed call input (bad URL, unsupported method, invalid header).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Network / TLS / timeout failure reaching the target host.
    #[error("Upstream unreachable: {detail}")]
    UpstreamUnreachable {
        detail: String,
        timed_out: bool,
        elapsed_ms: u64,
    },
}

impl ProxyError {
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::SessionNotFound => "SessionNotFound",
            ProxyError::InvalidRequest(_) => "InvalidRequest",
            ProxyError::UpstreamUnreachable { timed_out, .. } => {
                if *timed_out {
                    "TimeoutError"
                } else {
                    "ConnectionError"
                }
            }
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::SessionNotFound => StatusCode::NOT_FOUND,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamUnreachable { timed_out, .. } => {
                if *timed_out {
                    StatusCode::REQUEST_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = serde_json::json!({
            "error": self.to_string(),
            "error_type": self.error_type(),
        });

        if let ProxyError::UpstreamUnreachable { elapsed_ms, .. } = &self {
            body["elapsed_ms"] = serde_json::json!(elapsed_ms);
        }

        (status, Json(body)).into_response()
    }
}
