//! Inbound auth gate
//!
//! Optional API-key check applied before the orchestrator. Accepts either
//! `x-api-key: <key>` or `Authorization: Bearer <key>`; exempt paths bypass.
//! The axum wiring lives in the server; this module holds the decision logic
//! so it can be tested without a running router.

use crate::IngressError;
use axum::http::HeaderMap;
use nimbus_core::config::AuthSettings;

/// Extract the presented credential, `x-api-key` first.
fn presented_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

/// Check a request against the auth settings.
pub fn check(headers: &HeaderMap, path: &str, auth: &AuthSettings) -> Result<(), IngressError> {
    if !auth.enabled {
        return Ok(());
    }
    if auth.exempt_paths.iter().any(|exempt| exempt == path) {
        return Ok(());
    }

    match presented_key(headers) {
        Some(key) if key == auth.api_key => Ok(()),
        Some(_) => Err(IngressError::AuthenticationFailed(
            "invalid API key".to_string(),
        )),
        None => Err(IngressError::AuthenticationFailed(
            "missing API key: provide x-api-key or Authorization: Bearer".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AuthSettings {
        AuthSettings {
            enabled: true,
            api_key: "secret-key".to_string(),
            exempt_paths: vec!["/health".to_string()],
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_disabled_auth_passes_everything() {
        let auth = AuthSettings::default();
        assert!(check(&HeaderMap::new(), "/v1/messages", &auth).is_ok());
    }

    #[test]
    fn test_x_api_key_accepted() {
        let hdrs = headers(&[("x-api-key", "secret-key")]);
        assert!(check(&hdrs, "/v1/messages", &settings()).is_ok());
    }

    #[test]
    fn test_bearer_accepted() {
        let hdrs = headers(&[("authorization", "Bearer secret-key")]);
        assert!(check(&hdrs, "/v1/messages", &settings()).is_ok());
    }

    #[test]
    fn test_x_api_key_takes_precedence() {
        let hdrs = headers(&[
            ("x-api-key", "wrong"),
            ("authorization", "Bearer secret-key"),
        ]);
        assert!(check(&hdrs, "/v1/messages", &settings()).is_err());
    }

    #[test]
    fn test_missing_key_rejected() {
        assert!(check(&HeaderMap::new(), "/v1/messages", &settings()).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let hdrs = headers(&[("x-api-key", "nope")]);
        assert!(check(&hdrs, "/v1/messages", &settings()).is_err());
    }

    #[test]
    fn test_exempt_path_bypasses() {
        assert!(check(&HeaderMap::new(), "/health", &settings()).is_ok());
    }
}
