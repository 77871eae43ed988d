//! Client-facing error rendering
//!
//! All error responses use the Anthropic error envelope:
//! `{"type":"error","error":{"type":<category>,"message":...}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nimbus_core::ErrorKind;

/// Build the error envelope body.
pub fn error_body(kind: ErrorKind, message: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "error",
        "error": {
            "type": kind.wire_name(),
            "message": message,
        }
    })
}

/// Render an error response with the category's default status.
pub fn error_response(kind: ErrorKind, message: &str) -> Response {
    error_response_with_status(kind.http_status(), kind, message)
}

/// Render an error response with an explicit status (503-on-exhaustion keeps
/// the last error's category in the body).
pub fn error_response_with_status(status: u16, kind: ErrorKind, message: &str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(error_body(kind, message))).into_response()
}
