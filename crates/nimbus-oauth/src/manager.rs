//! OAuth manager
//!
//! Keeps zero or more account tokens, issues them round-robin, completes
//! PKCE authorization-code exchanges, and refreshes each token ahead of
//! expiry on its own background task. Token state is persisted after every
//! mutation; persisted tokens are loaded and scheduled at startup.

use crate::{
    store::SecretStore,
    token::{unix_now, TokenCredentials},
    OAuthError, Result,
};
use base64::Engine;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STATE_TTL_SECS: u64 = 600;

/// OAuth endpoints and refresh policy
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: String,
    /// Refresh this many seconds before expiry
    pub refresh_buffer_secs: u64,
    /// Deferral after a failed refresh (beyond the one immediate retry)
    pub refresh_retry_delay_secs: u64,
    /// Random jitter added to each scheduled refresh, avoiding synchronized
    /// storms across accounts
    pub refresh_jitter_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            authorize_url: "https://claude.ai/oauth/authorize".to_string(),
            token_url: "https://console.anthropic.com/v1/oauth/token".to_string(),
            client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".to_string(),
            redirect_uri: "https://console.anthropic.com/oauth/code/callback".to_string(),
            scopes: "org:create_api_key user:profile user:inference".to_string(),
            refresh_buffer_secs: 300,
            refresh_retry_delay_secs: 3600,
            refresh_jitter_secs: 30,
        }
    }
}

/// Inventory entry for the status endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct TokenStatus {
    pub account_email: String,
    pub expires_in_seconds: u64,
    pub healthy: bool,
    pub usage_count: u64,
    pub last_used: Option<u64>,
    pub scopes: Vec<String>,
}

struct PendingState {
    code_verifier: String,
    created_at: u64,
}

struct Inner {
    tokens: Vec<TokenCredentials>,
    next_index: usize,
    pending_states: HashMap<String, PendingState>,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Multi-account OAuth token manager
pub struct OAuthManager {
    config: OAuthConfig,
    client: reqwest::Client,
    store: Arc<dyn SecretStore>,
    inner: Mutex<Inner>,
    refresh_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    self_ref: Weak<Self>,
}

impl OAuthManager {
    pub fn new(config: OAuthConfig, store: Arc<dyn SecretStore>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            client: reqwest::Client::new(),
            store,
            inner: Mutex::new(Inner {
                tokens: Vec::new(),
                next_index: 0,
                pending_states: HashMap::new(),
            }),
            refresh_tasks: Mutex::new(HashMap::new()),
            self_ref: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("manager is alive")
    }

    /// Load persisted tokens and start their refresh schedules.
    pub fn load_persisted(&self) -> Result<usize> {
        let tokens = self.store.load()?;
        let count = tokens.len();
        let emails: Vec<String> = tokens.iter().map(|t| t.account_email.clone()).collect();
        {
            let mut inner = self.lock_inner();
            inner.tokens = tokens;
            inner.next_index = 0;
        }
        for email in emails {
            self.schedule_refresh(&email);
        }
        if count > 0 {
            info!(count, "loaded persisted OAuth tokens");
        }
        Ok(count)
    }

    /// Next usable token in round-robin order. Bumps the token's usage
    /// statistics and persists.
    pub fn issue_token(&self) -> Result<(String, String)> {
        let issued = {
            let mut inner = self.lock_inner();
            if inner.tokens.is_empty() {
                return Err(OAuthError::NoTokens);
            }

            let len = inner.tokens.len();
            let start = inner.next_index % len;
            let mut chosen = None;
            for offset in 0..len {
                let index = (start + offset) % len;
                if inner.tokens[index].is_usable() {
                    chosen = Some(index);
                    break;
                }
            }
            let Some(index) = chosen else {
                return Err(OAuthError::NoUsableToken);
            };

            inner.next_index = (index + 1) % len;
            let token = &mut inner.tokens[index];
            token.usage_count += 1;
            token.last_used = Some(unix_now());
            (token.access_token.clone(), token.account_email.clone())
        };
        self.persist();
        Ok(issued)
    }

    /// Begin an authorization flow: returns the authorize URL and the opaque
    /// state the callback must present.
    pub fn begin_authorize(&self) -> (String, String) {
        let mut verifier_bytes = [0u8; 48];
        rand::thread_rng().fill_bytes(&mut verifier_bytes);
        let code_verifier =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(verifier_bytes);
        let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(Sha256::digest(code_verifier.as_bytes()));

        let mut state_bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut state_bytes);
        let state = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(state_bytes);

        let url = format!(
            "{}?code=true&client_id={}&response_type=code&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
            self.config.authorize_url,
            self.config.client_id,
            urlencode(&self.config.redirect_uri),
            urlencode(&self.config.scopes),
            challenge,
            state,
        );

        let mut inner = self.lock_inner();
        prune_states(&mut inner.pending_states);
        inner.pending_states.insert(
            state.clone(),
            PendingState {
                code_verifier,
                created_at: unix_now(),
            },
        );

        (url, state)
    }

    /// Complete a PKCE exchange for `account_email`. The pasted code may
    /// carry the state after a `#` fragment.
    pub async fn exchange_code(
        &self,
        code: &str,
        account_email: &str,
    ) -> Result<TokenStatus> {
        let (code, state_hint) = match code.split_once('#') {
            Some((c, s)) => (c, Some(s.to_string())),
            None => (code, None),
        };
        let code = code.split('&').next().unwrap_or(code).trim();

        let code_verifier = {
            let mut inner = self.lock_inner();
            prune_states(&mut inner.pending_states);
            let state_key = match state_hint {
                Some(state) => Some(state),
                // A single pending flow is unambiguous
                None if inner.pending_states.len() == 1 => {
                    inner.pending_states.keys().next().cloned()
                }
                None => None,
            };
            state_key
                .and_then(|key| inner.pending_states.remove(&key))
                .map(|pending| pending.code_verifier)
                .ok_or_else(|| {
                    OAuthError::Exchange("no pending authorization state".to_string())
                })?
        };

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("client_id", self.config.client_id.as_str()),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("code_verifier", code_verifier.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::Exchange(format!("{}: {}", status, body)));
        }
        let parsed: TokenEndpointResponse = response
            .json()
            .await
            .map_err(|e| OAuthError::Exchange(format!("invalid token response: {}", e)))?;

        let token = TokenCredentials {
            access_token: parsed.access_token,
            refresh_token: parsed
                .refresh_token
                .ok_or_else(|| OAuthError::Exchange("no refresh_token in response".to_string()))?,
            expires_at: unix_now() + parsed.expires_in.unwrap_or(3600),
            scopes: parsed
                .scope
                .unwrap_or_else(|| self.config.scopes.clone())
                .split_whitespace()
                .map(String::from)
                .collect(),
            account_email: account_email.to_string(),
            usage_count: 0,
            last_used: None,
            created_at: Some(unix_now()),
            unusable: false,
        };
        let status = status_of(&token);

        {
            let mut inner = self.lock_inner();
            inner.tokens.retain(|t| t.account_email != account_email);
            inner.tokens.push(token);
        }
        self.persist();
        self.schedule_refresh(account_email);
        info!(account = account_email, "stored OAuth token");
        Ok(status)
    }

    /// Refresh one account's token: one immediate retry on failure, further
    /// retries deferred by the configured delay. A token is only flagged
    /// unusable once it is known-expired and a refresh has failed.
    pub async fn refresh(&self, account_email: &str) -> Result<()> {
        let refresh_token = {
            let inner = self.lock_inner();
            inner
                .tokens
                .iter()
                .find(|t| t.account_email == account_email)
                .map(|t| t.refresh_token.clone())
                .ok_or_else(|| OAuthError::UnknownAccount(account_email.to_string()))?
        };

        let mut last_error = None;
        for attempt in 0..2 {
            match self.call_refresh_endpoint(&refresh_token).await {
                Ok(parsed) => {
                    self.apply_refresh(account_email, parsed);
                    self.persist();
                    self.schedule_refresh(account_email);
                    info!(account = account_email, attempt, "OAuth token refreshed");
                    return Ok(());
                }
                Err(e) => {
                    warn!(account = account_email, attempt, error = %e, "token refresh attempt failed");
                    last_error = Some(e);
                }
            }
        }

        // Both attempts failed; defer another try and flag the token if the
        // access token itself is already gone.
        let expired = {
            let mut inner = self.lock_inner();
            match inner
                .tokens
                .iter_mut()
                .find(|t| t.account_email == account_email)
            {
                Some(token) => {
                    let expired = token.is_expired(0);
                    if expired {
                        token.unusable = true;
                    }
                    expired
                }
                None => false,
            }
        };
        self.persist();
        if expired {
            warn!(account = account_email, "token marked unusable after failed refresh on expired token");
        } else {
            self.schedule_retry(account_email);
        }

        Err(last_error.unwrap_or_else(|| OAuthError::Refresh("refresh failed".to_string())))
    }

    /// Force-refresh every account (the `/oauth/refresh-token` endpoint
    /// without a body).
    pub async fn refresh_all(&self) -> Vec<(String, Result<()>)> {
        let emails: Vec<String> = {
            let inner = self.lock_inner();
            inner.tokens.iter().map(|t| t.account_email.clone()).collect()
        };
        let mut results = Vec::with_capacity(emails.len());
        for email in emails {
            let result = self.refresh(&email).await;
            results.push((email, result));
        }
        results
    }

    /// Remove one account's token and cancel its refresh schedule.
    pub fn delete(&self, account_email: &str) -> Result<()> {
        let removed = {
            let mut inner = self.lock_inner();
            let before = inner.tokens.len();
            inner.tokens.retain(|t| t.account_email != account_email);
            before != inner.tokens.len()
        };
        if !removed {
            return Err(OAuthError::UnknownAccount(account_email.to_string()));
        }
        self.cancel_refresh(account_email);
        self.persist();
        info!(account = account_email, "OAuth token deleted");
        Ok(())
    }

    /// Remove every token and cancel all schedules.
    pub fn clear(&self) -> usize {
        let count = {
            let mut inner = self.lock_inner();
            let count = inner.tokens.len();
            inner.tokens.clear();
            inner.next_index = 0;
            count
        };
        let mut tasks = self.refresh_tasks.lock().unwrap_or_else(|p| p.into_inner());
        for (_, task) in tasks.drain() {
            task.abort();
        }
        self.persist();
        count
    }

    /// Token inventory for `/oauth/status`.
    pub fn status(&self) -> Vec<TokenStatus> {
        let inner = self.lock_inner();
        inner.tokens.iter().map(status_of).collect()
    }

    pub fn token_count(&self) -> usize {
        self.lock_inner().tokens.len()
    }

    async fn call_refresh_endpoint(&self, refresh_token: &str) -> Result<TokenEndpointResponse> {
        let response = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.config.client_id.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::Refresh(format!("{}: {}", status, body)));
        }
        response
            .json()
            .await
            .map_err(|e| OAuthError::Refresh(format!("invalid token response: {}", e)))
    }

    fn apply_refresh(&self, account_email: &str, parsed: TokenEndpointResponse) {
        let mut inner = self.lock_inner();
        if let Some(token) = inner
            .tokens
            .iter_mut()
            .find(|t| t.account_email == account_email)
        {
            token.access_token = parsed.access_token;
            if let Some(rt) = parsed.refresh_token {
                token.refresh_token = rt;
            }
            token.expires_at = unix_now() + parsed.expires_in.unwrap_or(3600);
            token.unusable = false;
        }
    }

    /// Schedule the next refresh at `expires_at − buffer`, plus jitter.
    fn schedule_refresh(&self, account_email: &str) {
        let expires_at = {
            let inner = self.lock_inner();
            match inner
                .tokens
                .iter()
                .find(|t| t.account_email == account_email)
            {
                Some(token) => token.expires_at,
                None => return,
            }
        };

        let fire_at = expires_at.saturating_sub(self.config.refresh_buffer_secs);
        let base_delay = fire_at.saturating_sub(unix_now());
        let jitter = if self.config.refresh_jitter_secs > 0 {
            rand::thread_rng().next_u64() % self.config.refresh_jitter_secs
        } else {
            0
        };
        let delay = Duration::from_secs(base_delay + jitter);

        debug!(
            account = account_email,
            delay_secs = delay.as_secs(),
            "scheduled token refresh"
        );
        self.spawn_refresh_task(account_email, delay);
    }

    fn schedule_retry(&self, account_email: &str) {
        let delay = Duration::from_secs(self.config.refresh_retry_delay_secs);
        warn!(
            account = account_email,
            retry_in_secs = delay.as_secs(),
            "deferring next refresh attempt"
        );
        self.spawn_refresh_task(account_email, delay);
    }

    fn spawn_refresh_task(&self, account_email: &str, delay: Duration) {
        let manager = self.arc();
        let email = account_email.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // refresh() reschedules on both success and deferred failure
            let _ = manager.refresh(&email).await;
        });

        let mut tasks = self.refresh_tasks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = tasks.insert(account_email.to_string(), task) {
            previous.abort();
        }
    }

    fn cancel_refresh(&self, account_email: &str) {
        let mut tasks = self.refresh_tasks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(task) = tasks.remove(account_email) {
            task.abort();
        }
    }

    fn persist(&self) {
        let tokens = self.lock_inner().tokens.clone();
        if let Err(e) = self.store.save(&tokens) {
            warn!(error = %e, "failed to persist OAuth tokens");
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn insert_token_for_tests(&self, token: TokenCredentials) {
        self.lock_inner().tokens.push(token);
    }
}

fn status_of(token: &TokenCredentials) -> TokenStatus {
    TokenStatus {
        account_email: token.account_email.clone(),
        expires_in_seconds: token.expires_in(),
        healthy: !token.unusable && !token.is_expired(300),
        usage_count: token.usage_count,
        last_used: token.last_used,
        scopes: token.scopes.clone(),
    }
}

fn prune_states(states: &mut HashMap<String, PendingState>) {
    let now = unix_now();
    states.retain(|_, s| now.saturating_sub(s.created_at) < STATE_TTL_SECS);
}

fn urlencode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}
