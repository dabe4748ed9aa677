//! Server error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Server result type
pub type Result<T> = std::result::Result<T, ServerError>;

/// Error kinds surfaced to clients; the wire shape follows the
/// completion API convention: `{"error": {"code", "message", "type"}}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request, incompatible parameters, bad slot id
    InvalidRequest,
    /// Server loading or no slot free
    Unavailable,
    /// Endpoint disabled by configuration
    NotSupported,
    /// Missing or invalid API key
    Authentication,
    /// Decode failure, transport failure, KV full after retries
    Server,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::NotSupported => StatusCode::NOT_IMPLEMENTED,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Server => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn type_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request_error",
            ErrorKind::Unavailable => "unavailable_error",
            ErrorKind::NotSupported => "not_supported_error",
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::Server => "server_error",
        }
    }
}

/// Server error types
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{message}")]
    Api { kind: ErrorKind, message: String },

    #[error("Engine error: {0}")]
    Engine(#[from] ringlm_engine::EngineError),

    #[error("Model error: {0}")]
    Model(#[from] ringlm_model::ModelError),

    #[error("KV error: {0}")]
    Kv(#[from] ringlm_kv::KvError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Api {
            kind: ErrorKind::InvalidRequest,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Api {
            kind: ErrorKind::Unavailable,
            message: message.into(),
        }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::Api {
            kind: ErrorKind::NotSupported,
            message: message.into(),
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::Api {
            kind: ErrorKind::Server,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::Api { kind, .. } => *kind,
            _ => ErrorKind::Server,
        }
    }
}

/// Shape an error body the way the completion API expects it
pub fn format_error_response(message: &str, kind: ErrorKind) -> serde_json::Value {
    json!({
        "error": {
            "code": kind.status().as_u16(),
            "message": message,
            "type": kind.type_str(),
        }
    })
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let body = format_error_response(&self.to_string(), kind);
        (kind.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            ServerError::invalid("bad").kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(ErrorKind::Authentication.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::Unavailable.status().as_u16(), 503);
    }

    #[test]
    fn test_error_body_shape() {
        let body = format_error_response("no slot", ErrorKind::Unavailable);
        assert_eq!(body["error"]["code"], 503);
        assert_eq!(body["error"]["type"], "unavailable_error");
    }
}
