//! Router assembly

use crate::{admin, pipeline, state::AppState};
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;

/// Build the full HTTP surface over shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(pipeline::messages))
        .route("/v1/messages/count_tokens", post(pipeline::count_tokens))
        .route("/health", get(admin::health))
        .route("/providers", get(admin::providers))
        .route("/providers/reload", post(admin::reload))
        .route("/oauth/status", get(admin::oauth_status))
        .route("/oauth/generate-url", post(admin::oauth_generate_url))
        .route("/oauth/exchange-code", post(admin::oauth_exchange_code))
        .route("/oauth/refresh-token", post(admin::oauth_refresh))
        .route("/oauth/tokens/:email", delete(admin::oauth_delete_token))
        .route("/oauth/tokens", delete(admin::oauth_clear_tokens))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_gate,
        ))
        .with_state(state)
}

/// Inbound auth gate. Reads the settings from the current snapshot so a
/// reload takes effect without a restart.
async fn auth_gate(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let snapshot = state.config.load();
    let path = request.uri().path().to_string();
    if let Err(e) = nimbus_ingress::auth::check(request.headers(), &path, &snapshot.settings.auth) {
        return e.into_response();
    }
    next.run(request).await
}
