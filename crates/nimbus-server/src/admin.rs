//! Management endpoints: liveness, provider health, config reload, and the
//! OAuth account surface.

use crate::errors::error_response;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use nimbus_core::ErrorKind;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.config.load();
    let cooldown = Duration::from_secs(snapshot.settings.failure_cooldown);
    let healthy = snapshot
        .providers
        .iter()
        .filter(|p| p.enabled && state.health.snapshot(&p.name, cooldown).healthy)
        .count();

    Json(serde_json::json!({
        "status": "ok",
        "providers": snapshot.providers.len(),
        "healthy_providers": healthy,
    }))
    .into_response()
}

/// `GET /providers`
pub async fn providers(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.config.load();
    let cooldown = Duration::from_secs(snapshot.settings.failure_cooldown);

    let entries: Vec<serde_json::Value> = snapshot
        .providers
        .iter()
        .map(|provider| {
            let health = state.health.snapshot(&provider.name, cooldown);
            serde_json::json!({
                "name": provider.name,
                "type": provider.kind,
                "base_url": provider.base_url,
                "enabled": provider.enabled,
                "healthy": health.healthy,
                "error_count": health.error_count,
                "unhealthy_for_seconds": health.unhealthy_for_seconds,
                "last_success": health.last_success,
            })
        })
        .collect();

    Json(entries).into_response()
}

/// `POST /providers/reload`
pub async fn reload(State(state): State<Arc<AppState>>) -> Response {
    match state.config.reload() {
        Ok(()) => {
            let snapshot = state.config.load();
            Json(serde_json::json!({
                "status": "reloaded",
                "providers": snapshot.providers.len(),
                "model_routes": snapshot.routes.len(),
            }))
            .into_response()
        }
        Err(e) => error_response(ErrorKind::InvalidRequest, &e.to_string()),
    }
}

/// `GET /oauth/status`
pub async fn oauth_status(State(state): State<Arc<AppState>>) -> Response {
    Json(state.oauth.status()).into_response()
}

/// `POST /oauth/generate-url` — start a PKCE flow; the returned URL is opened
/// by the operator, and the resulting code goes to `/oauth/exchange-code`.
pub async fn oauth_generate_url(State(state): State<Arc<AppState>>) -> Response {
    let (auth_url, oauth_state) = state.oauth.begin_authorize();
    Json(serde_json::json!({
        "auth_url": auth_url,
        "state": oauth_state,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ExchangeCodeBody {
    pub code: String,
    pub account_email: String,
}

/// `POST /oauth/exchange-code`
pub async fn oauth_exchange_code(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExchangeCodeBody>,
) -> Response {
    match state.oauth.exchange_code(&body.code, &body.account_email).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => error_response(ErrorKind::InvalidRequest, &e.to_string()),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshBody {
    #[serde(default)]
    pub account_email: Option<String>,
}

/// `POST /oauth/refresh-token` — one account, or all when the body names
/// none.
pub async fn oauth_refresh(
    State(state): State<Arc<AppState>>,
    body: Option<Json<RefreshBody>>,
) -> Response {
    let account = body.and_then(|Json(b)| b.account_email);
    match account {
        Some(email) => match state.oauth.refresh(&email).await {
            Ok(()) => Json(serde_json::json!({"refreshed": [email]})).into_response(),
            Err(e) => error_response(ErrorKind::InvalidRequest, &e.to_string()),
        },
        None => {
            let results = state.oauth.refresh_all().await;
            let report: Vec<serde_json::Value> = results
                .into_iter()
                .map(|(email, result)| {
                    serde_json::json!({
                        "account_email": email,
                        "ok": result.is_ok(),
                        "error": result.err().map(|e| e.to_string()),
                    })
                })
                .collect();
            Json(serde_json::json!({"results": report})).into_response()
        }
    }
}

/// `DELETE /oauth/tokens/{email}`
pub async fn oauth_delete_token(
    State(state): State<Arc<AppState>>,
    Path(email): Path<String>,
) -> Response {
    match state.oauth.delete(&email) {
        Ok(()) => Json(serde_json::json!({"deleted": email})).into_response(),
        Err(e) => error_response(ErrorKind::NotFound, &e.to_string()),
    }
}

/// `DELETE /oauth/tokens`
pub async fn oauth_clear_tokens(State(state): State<Arc<AppState>>) -> Response {
    let removed = state.oauth.clear();
    Json(serde_json::json!({"deleted": removed})).into_response()
}
