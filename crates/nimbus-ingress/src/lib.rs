//! Nimbus Ingress
//!
//! The client-facing edge: Anthropic Messages wire types and their
//! conversions to and from the normalized model, the Anthropic SSE encoder,
//! the inbound auth gate, and the token-count estimate.

use axum::response::IntoResponse;
use nimbus_core::ErrorKind;
use thiserror::Error;

pub mod anthropic;
pub mod auth;
pub mod count_tokens;
pub mod sse;

/// Ingress error types
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngressError {
    fn kind(&self) -> ErrorKind {
        match self {
            IngressError::InvalidRequest(_) | IngressError::Serialization(_) => {
                ErrorKind::InvalidRequest
            }
            IngressError::AuthenticationFailed(_) => ErrorKind::Authentication,
            IngressError::Internal(_) => ErrorKind::Api,
        }
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> axum::response::Response {
        let kind = self.kind();
        let status = axum::http::StatusCode::from_u16(kind.http_status())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "type": "error",
            "error": {
                "type": kind.wire_name(),
                "message": self.to_string(),
            }
        });
        (status, axum::Json(body)).into_response()
    }
}

pub type IngressResult<T> = Result<T, IngressError>;
