//! Error taxonomy.  `ProxyError` is what a caller can see; `ExtensionError`
//! never leaves the pipeline.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Authentication(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    /// Upstream answered with a non-2xx status.  `body` is the raw payload.
    #[error("upstream returned {}: {}", .status.as_u16(), .body)]
    Upstream { status: StatusCode, body: String },
    /// The upstream could not be reached or the response could not be read.
    #[error("upstream request failed: {0}")]
    Transport(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ProxyError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Upstream { status, .. } => *status,
            ProxyError::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::PayloadTooLarge(_) => {
                "invalid_request_error"
            }
            ProxyError::Authentication(_) => "authentication_error",
            ProxyError::Upstream { .. } | ProxyError::Transport(_) => "server_error",
        }
    }

    /// JSON body returned to the caller.  Upstream bodies that are valid JSON
    /// are passed through untouched.
    pub fn body(&self) -> Value {
        if let ProxyError::Upstream { body, .. } = self {
            if let Ok(parsed) = serde_json::from_str::<Value>(body) {
                return parsed;
            }
            return error_body(self.kind(), body);
        }
        error_body(self.kind(), &self.to_string())
    }
}

/// `{"error": {"type": .., "message": ..}}`
pub fn error_body(kind: &str, message: &str) -> Value {
    json!({ "error": { "type": kind, "message": message } })
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("extension transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("extension hook {hook} answered with status {status}")]
    Status { hook: &'static str, status: u16 },
    #[error("extension hook {hook} returned an undecodable body: {source}")]
    Decode {
        hook: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("extension hook failed: {0}")]
    Hook(String),
}
