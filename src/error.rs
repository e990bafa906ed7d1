use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("KP '{0}' is already registered")]
    Duplicate(String),

    #[error("KP '{0}' is not registered")]
    UnknownKP(String),

    #[error("KP '{kp_id}' unreachable: {message}")]
    KPUnreachable {
        kp_id: String,
        message: String,
        request: Value,
    },

    #[error("KP '{kp_id}' returned status {status}")]
    KPStatusError {
        kp_id: String,
        status: u16,
        body: String,
    },

    #[error("KP '{kp_id}' returned a malformed response: {reason}")]
    KPMalformedResponse {
        kp_id: String,
        reason: String,
        request: Value,
    },

    #[error("batching error for '{kp_id}': {reason}")]
    BatchingError {
        kp_id: String,
        reason: String,
        request: Value,
    },

    #[error("KP '{kp_id}' returned a query graph missing a pinned node")]
    MalformedQGraph { kp_id: String },

    #[error("KP '{kp_id}' response is missing query_graph")]
    MissingQGraph { kp_id: String },

    #[error("KP '{kp_id}' response is missing knowledge_graph")]
    MissingKGraph { kp_id: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),
}

impl ThrottleError {
    /// The KP this error concerns, when it carries one.
    pub fn kp_id(&self) -> Option<&str> {
        match self {
            Self::Duplicate(id)
            | Self::UnknownKP(id)
            | Self::KPUnreachable { kp_id: id, .. }
            | Self::KPStatusError { kp_id: id, .. }
            | Self::KPMalformedResponse { kp_id: id, .. }
            | Self::BatchingError { kp_id: id, .. }
            | Self::MalformedQGraph { kp_id: id }
            | Self::MissingQGraph { kp_id: id }
            | Self::MissingKGraph { kp_id: id } => Some(id),
            Self::Cancelled | Self::Timeout(_) | Self::InvalidRegistration(_) => None,
        }
    }

    /// A short machine-readable tag for the error body's `"error"` key,
    /// distinct from the human-readable `"message"` the `Display` impl
    /// produces.
    fn kind(&self) -> &'static str {
        match self {
            Self::Duplicate(_) => "duplicate",
            Self::UnknownKP(_) => "unknown_kp",
            Self::KPUnreachable { .. } => "kp_unreachable",
            Self::KPStatusError { .. } => "kp_status_error",
            Self::KPMalformedResponse { .. } => "kp_malformed_response",
            Self::BatchingError { .. } => "batching_error",
            Self::MalformedQGraph { .. } => "malformed_qgraph",
            Self::MissingQGraph { .. } => "missing_qgraph",
            Self::MissingKGraph { .. } => "missing_kgraph",
            Self::Cancelled => "cancelled",
            Self::Timeout(_) => "timeout",
            Self::InvalidRegistration(_) => "invalid_registration",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Duplicate(_) => StatusCode::CONFLICT,
            Self::UnknownKP(_) => StatusCode::NOT_FOUND,
            Self::InvalidRegistration(_) => StatusCode::BAD_REQUEST,
            Self::KPStatusError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Self::KPUnreachable { .. }
            | Self::KPMalformedResponse { .. }
            | Self::BatchingError { .. }
            | Self::MalformedQGraph { .. }
            | Self::MissingQGraph { .. }
            | Self::MissingKGraph { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Carries a human-readable message plus, where known, the outgoing
/// request and the upstream response that produced it, so an operator can
/// diagnose a failing KP without re-running the query.
impl IntoResponse for ThrottleError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
            "kp_id": self.kp_id(),
        });

        match &self {
            Self::KPUnreachable { request, .. }
            | Self::KPMalformedResponse { request, .. }
            | Self::BatchingError { request, .. } => {
                body["request"] = request.clone();
            }
            Self::KPStatusError { status, body: resp, .. } => {
                body["status"] = json!(status);
                body["response"] = json!(resp);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}
