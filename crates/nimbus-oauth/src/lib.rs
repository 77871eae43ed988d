//! Nimbus OAuth
//!
//! Multi-account OAuth token management: PKCE authorization-code exchange,
//! automatic refresh ahead of expiry, round-robin issuance, and encrypted
//! persistence.

use thiserror::Error;

pub mod manager;
pub mod store;
pub mod token;

pub use manager::{OAuthConfig, OAuthManager, TokenStatus};
pub use store::{EncryptedFileStore, MemoryStore, SecretStore};
pub use token::TokenCredentials;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no OAuth tokens available")]
    NoTokens,

    #[error("no usable OAuth token (all expired or unusable)")]
    NoUsableToken,

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("token exchange failed: {0}")]
    Exchange(String),

    #[error("token refresh failed: {0}")]
    Refresh(String),

    #[error("secret store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OAuthError>;

impl From<OAuthError> for nimbus_core::Error {
    fn from(err: OAuthError) -> Self {
        nimbus_core::Error::OAuth(err.to_string())
    }
}
