//! Error types for Nimbus Core

use thiserror::Error;

/// Transport-level failure classes.
///
/// These are the exception classes that count towards a provider's unhealthy
/// threshold regardless of configuration (connect/read timeouts, TLS and DNS
/// failures, resets).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    ConnectTimeout,
    ReadTimeout,
    TlsHandshake,
    DnsFailure,
    ConnectionReset,
    Other,
}

impl TransportKind {
    /// Whether this transport failure qualifies for unhealthy counting.
    pub fn is_qualifying(self) -> bool {
        !matches!(self, TransportKind::Other)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Upstream returned a non-success HTTP status. The decoded body preview
    /// is retained so the orchestrator can run pattern probing over it.
    #[error("Upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("Transport failure: {message}")]
    Transport {
        kind: TransportKind,
        message: String,
    },

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    /// Error surfaced inside an upstream SSE stream (`event: error`).
    #[error("Upstream stream error ({error_type}): {message}")]
    StreamError { error_type: String, message: String },

    #[error("Stream error: {0}")]
    Stream(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outward-visible error categories, rendered in the Anthropic error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    InvalidRequest,
    NotFound,
    RateLimit,
    Api,
    Overloaded,
    Timeout,
}

impl ErrorKind {
    /// The `error.type` string used on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::InvalidRequest => "invalid_request_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::RateLimit => "rate_limit_error",
            ErrorKind::Api => "api_error",
            ErrorKind::Overloaded => "overloaded_error",
            ErrorKind::Timeout => "timeout_error",
        }
    }

    /// HTTP status returned to the client for this category.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Authentication => 401,
            ErrorKind::InvalidRequest => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::RateLimit => 429,
            ErrorKind::Api => 502,
            ErrorKind::Overloaded => 529,
            ErrorKind::Timeout => 504,
        }
    }

    /// Categorize an upstream HTTP status surfaced after exhaustion.
    pub fn from_upstream_status(status: u16) -> Self {
        match status {
            401 | 403 => ErrorKind::Authentication,
            404 => ErrorKind::NotFound,
            429 => ErrorKind::RateLimit,
            529 => ErrorKind::Overloaded,
            408 | 504 => ErrorKind::Timeout,
            _ => ErrorKind::Api,
        }
    }
}

impl Error {
    /// Map an internal error to the client-facing category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Serialization(_) | Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::UpstreamStatus { status, .. } => ErrorKind::from_upstream_status(*status),
            Error::Transport { .. } | Error::Stream(_) => ErrorKind::Api,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::StreamError { error_type, .. } => match error_type.as_str() {
                "overloaded_error" => ErrorKind::Overloaded,
                "rate_limit_error" => ErrorKind::RateLimit,
                "authentication_error" => ErrorKind::Authentication,
                _ => ErrorKind::Api,
            },
            Error::OAuth(_) => ErrorKind::Authentication,
            _ => ErrorKind::Api,
        }
    }
}
