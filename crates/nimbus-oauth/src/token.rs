//! OAuth token credentials

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One account's OAuth credentials, as persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCredentials {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp of access token expiry
    pub expires_at: u64,
    pub scopes: Vec<String>,
    pub account_email: String,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub last_used: Option<u64>,
    #[serde(default)]
    pub created_at: Option<u64>,
    /// Set once the access token is known-expired and a refresh attempt has
    /// failed; such tokens are skipped by issuance
    #[serde(default)]
    pub unusable: bool,
}

impl TokenCredentials {
    /// Whether the access token is expired, or will be within
    /// `buffer_seconds`.
    pub fn is_expired(&self, buffer_seconds: u64) -> bool {
        unix_now() + buffer_seconds >= self.expires_at
    }

    /// Seconds until expiry (zero if already expired).
    pub fn expires_in(&self) -> u64 {
        self.expires_at.saturating_sub(unix_now())
    }

    /// Usable for issuance: not flagged and not already expired.
    pub fn is_usable(&self) -> bool {
        !self.unusable && !self.is_expired(0)
    }
}
