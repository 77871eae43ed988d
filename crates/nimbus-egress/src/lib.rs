//! Nimbus Egress Connectors
//!
//! Connectors to upstream LLM providers:
//! - OpenAI chat-completions dialect
//! - Anthropic messages dialect
//!
//! Both implement the core [`Provider`](nimbus_core::provider::Provider)
//! trait over the normalized model, for unary and streaming calls.

use nimbus_core::TransportKind;
use thiserror::Error;

pub mod anthropic;
pub mod auth;
pub mod client;
pub mod openai;

pub use auth::ResolvedAuth;
pub use client::{ClientPool, HttpClientConfig};

/// Egress-specific errors
#[derive(Debug, Error)]
pub enum EgressError {
    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider returned a non-success status
    #[error("Provider error: {status_code} - {message}")]
    Provider { status_code: u16, message: String },

    /// Failed to parse a provider response
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// Stream-level failure
    #[error("Stream error: {0}")]
    Stream(String),

    /// Invalid connector configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EgressError>;

/// Classify a reqwest failure into the transport taxonomy used by the health
/// engine.
pub(crate) fn transport_kind(error: &reqwest::Error) -> TransportKind {
    if error.is_timeout() {
        return if error.is_connect() {
            TransportKind::ConnectTimeout
        } else {
            TransportKind::ReadTimeout
        };
    }
    let message = error.to_string().to_lowercase();
    if message.contains("dns") || message.contains("resolve") {
        return TransportKind::DnsFailure;
    }
    if message.contains("tls") || message.contains("ssl") || message.contains("certificate") {
        return TransportKind::TlsHandshake;
    }
    if error.is_connect() || message.contains("reset") || message.contains("broken pipe") {
        return TransportKind::ConnectionReset;
    }
    TransportKind::Other
}

impl From<EgressError> for nimbus_core::Error {
    fn from(err: EgressError) -> Self {
        match err {
            EgressError::Http(e) => nimbus_core::Error::Transport {
                kind: transport_kind(&e),
                message: e.to_string(),
            },
            EgressError::Provider {
                status_code,
                message,
            } => nimbus_core::Error::UpstreamStatus {
                status: status_code,
                body: message,
            },
            EgressError::Parse(msg) | EgressError::Stream(msg) => nimbus_core::Error::Stream(msg),
            EgressError::Config(msg) => nimbus_core::Error::Config(msg),
            EgressError::Serialization(e) => nimbus_core::Error::Serialization(e),
        }
    }
}
