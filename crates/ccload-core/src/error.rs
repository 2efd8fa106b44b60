use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::json;
use thiserror::Error;

/// The crate-wide error seam (spec §6.2): carries the terminal HTTP
/// response directly so handlers can `?`-propagate it.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("client input error: {message}")]
    ClientInput { status: StatusCode, message: String },
    #[error("no available channel")]
    NoAvailableChannel,
    #[error("storage error: {0}")]
    Storage(#[from] ccload_storage::StorageError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::ClientInput {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::ClientInput {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::ClientInput {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ProxyError::ClientInput { status, message } => (status, message),
            ProxyError::NoAvailableChannel => (
                StatusCode::BAD_GATEWAY,
                "no available channel".to_string(),
            ),
            ProxyError::Storage(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            ProxyError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "error": { "message": message } }))).into_response()
    }
}

/// Classification of a terminal forward attempt, used by the retry
/// orchestrator to decide cooldown + retry behaviour (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ClientInput,
    UpstreamAuth,
    UpstreamRateLimit,
    UpstreamServer,
    ClientCancel,
}

/// Reserved internal statuses (spec §7): never sent upstream, only used
/// internally and translated before the client sees them.
pub const STATUS_CLIENT_CLOSED: u16 = 499;
pub const STATUS_FIRST_BYTE_TIMEOUT: u16 = 598;

pub fn classify_status(status: u16) -> Option<ErrorKind> {
    match status {
        401 | 403 => Some(ErrorKind::UpstreamAuth),
        408 | 429 => Some(ErrorKind::UpstreamRateLimit),
        STATUS_CLIENT_CLOSED => Some(ErrorKind::ClientCancel),
        400..=499 => Some(ErrorKind::ClientInput),
        500..=599 => Some(ErrorKind::UpstreamServer),
        _ => None,
    }
}

/// Translates a reserved internal status into what the client actually
/// receives on the wire (spec §6: "499 for connection-close, 504 for 598").
pub fn external_status(status: u16) -> StatusCode {
    match status {
        STATUS_FIRST_BYTE_TIMEOUT => StatusCode::GATEWAY_TIMEOUT,
        STATUS_CLIENT_CLOSED => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        other => StatusCode::from_u16(other).unwrap_or(StatusCode::BAD_GATEWAY),
    }
}

pub fn synthesize_exhausted() -> (StatusCode, Bytes) {
    (
        StatusCode::BAD_GATEWAY,
        Bytes::from_static(br#"{"error":{"message":"no available channel"}}"#),
    )
}
