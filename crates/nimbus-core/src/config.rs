//! Configuration model and atomic snapshot handle
//!
//! Configuration is loaded from a YAML file with three top-level keys:
//! `providers`, `model_routes` and `settings`. A parsed file becomes an
//! immutable [`ConfigSnapshot`]; reload builds a fresh snapshot and swaps it
//! in only after validation succeeds, so in-flight requests keep the snapshot
//! they started with and a broken file never disturbs the running one.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Upstream wire dialect of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
}

/// How the proxy authenticates against a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    /// `x-api-key` header
    ApiKey,
    /// `Authorization: Bearer` header
    AuthToken,
    /// Bearer token issued by the OAuth manager
    OAuth,
}

/// Candidate ordering strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    Priority,
    RoundRobin,
    Random,
}

/// `auth_value` sentinel: resolve the credential through the OAuth manager.
pub const AUTH_VALUE_OAUTH: &str = "oauth";
/// `auth_value` sentinel: forward the inbound request's credential.
pub const AUTH_VALUE_PASSTHROUGH: &str = "passthrough";
/// Route model sentinel: forward the client's model name unchanged.
pub const MODEL_PASSTHROUGH: &str = "passthrough";

/// Immutable identity of one upstream provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub base_url: String,
    pub auth_type: AuthKind,
    pub auth_value: String,
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ProviderConfig {
    pub fn uses_oauth(&self) -> bool {
        self.auth_type == AuthKind::OAuth || self.auth_value == AUTH_VALUE_OAUTH
    }

    pub fn uses_passthrough_auth(&self) -> bool {
        self.auth_value == AUTH_VALUE_PASSTHROUGH
    }
}

/// One entry of a model route: where to send the call and as which model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteTarget {
    pub provider: String,
    pub model: String,
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// An ordered route pattern with its targets
#[derive(Debug, Clone)]
pub struct ModelRoutePattern {
    pub pattern: String,
    pub targets: Vec<RouteTarget>,
}

/// Inbound authentication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            exempt_paths: default_exempt_paths(),
        }
    }
}

/// Global settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub selection_strategy: SelectionStrategy,

    /// Seconds an unhealthy provider stays unselectable
    #[serde(default = "default_failure_cooldown")]
    pub failure_cooldown: u64,

    /// Seconds the last successful provider is preferred
    #[serde(default = "default_sticky_duration")]
    pub sticky_provider_duration: u64,

    /// Consecutive qualifying failures before a provider is marked unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// HTTP statuses that count as qualifying failures
    #[serde(default = "default_unhealthy_http_codes")]
    pub unhealthy_http_codes: Vec<u16>,

    /// Substring patterns matched against decoded response bodies
    #[serde(default = "default_unhealthy_error_types")]
    pub unhealthy_error_types: Vec<String>,

    /// Regex patterns matched against decoded response bodies
    #[serde(default)]
    pub unhealthy_response_body_patterns: Vec<String>,

    /// Non-streaming upstream call timeout, seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Absolute bound on a streaming response, seconds
    #[serde(default = "default_streaming_total_timeout")]
    pub streaming_total_timeout: u64,

    /// Maximum silence between upstream chunks, seconds
    #[serde(default = "default_streaming_idle_timeout")]
    pub streaming_idle_timeout: u64,

    #[serde(default = "default_true")]
    pub deduplication_enabled: bool,

    /// Lifetime of a deduplication entry (and of a completed broadcaster's
    /// replay window), seconds
    #[serde(default = "default_deduplication_ttl")]
    pub deduplication_ttl: u64,

    /// Frames a subscriber may fall behind before it is disconnected
    #[serde(default = "default_subscriber_backlog_max")]
    pub subscriber_backlog_max: usize,

    /// Concurrent upstream calls allowed per provider
    #[serde(default = "default_max_upstream_connections")]
    pub max_upstream_connections_per_provider: usize,

    #[serde(default)]
    pub auth: AuthSettings,
}

impl Default for Settings {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty settings always parse")
    }
}

fn default_true() -> bool {
    true
}

fn default_failure_cooldown() -> u64 {
    180
}

fn default_sticky_duration() -> u64 {
    300
}

fn default_unhealthy_threshold() -> u32 {
    2
}

fn default_unhealthy_http_codes() -> Vec<u16> {
    vec![402, 404, 408, 429, 500, 502, 503, 504, 520, 521, 522, 523, 524]
}

fn default_unhealthy_error_types() -> Vec<String> {
    ["insufficient", "quota", "exceeded", "overloaded", "rate limit"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_streaming_total_timeout() -> u64 {
    600
}

fn default_streaming_idle_timeout() -> u64 {
    120
}

fn default_deduplication_ttl() -> u64 {
    60
}

fn default_subscriber_backlog_max() -> usize {
    1024
}

fn default_max_upstream_connections() -> usize {
    64
}

fn default_exempt_paths() -> Vec<String> {
    vec!["/health".to_string()]
}

/// Raw file shape; `model_routes` is kept as a YAML mapping so pattern order
/// is preserved exactly as written.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    providers: Vec<ProviderConfig>,
    #[serde(default)]
    model_routes: serde_yaml::Mapping,
    #[serde(default)]
    settings: Settings,
}

/// A parsed, validated, immutable configuration snapshot
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub providers: Vec<ProviderConfig>,
    pub routes: Vec<ModelRoutePattern>,
    pub settings: Settings,
}

impl ConfigSnapshot {
    /// Parse a YAML document into a validated snapshot.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(contents)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        let mut providers = file.providers;
        for provider in &mut providers {
            provider.auth_value = substitute_env(&provider.auth_value)?;
        }

        let mut routes = Vec::with_capacity(file.model_routes.len());
        for (key, value) in file.model_routes {
            let pattern = key
                .as_str()
                .ok_or_else(|| Error::Config("model route pattern must be a string".to_string()))?
                .to_string();
            let targets: Vec<RouteTarget> = serde_yaml::from_value(value).map_err(|e| {
                Error::Config(format!("invalid route entries for '{}': {}", pattern, e))
            })?;
            routes.push(ModelRoutePattern { pattern, targets });
        }

        let mut settings = file.settings;
        settings.auth.api_key = substitute_env(&settings.auth.api_key)?;

        let snapshot = Self {
            providers,
            routes,
            settings,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Look up a provider by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(Error::ConfigValidation(
                "at least one provider must be configured".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(Error::ConfigValidation(
                    "provider name cannot be empty".to_string(),
                ));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(Error::ConfigValidation(format!(
                    "duplicate provider name '{}'",
                    provider.name
                )));
            }
            if provider.base_url.is_empty() {
                return Err(Error::ConfigValidation(format!(
                    "provider '{}' has an empty base_url",
                    provider.name
                )));
            }
        }

        for route in &self.routes {
            for target in &route.targets {
                if self.provider(&target.provider).is_none() {
                    return Err(Error::ConfigValidation(format!(
                        "route '{}' references unknown provider '{}'",
                        route.pattern, target.provider
                    )));
                }
            }
        }

        let s = &self.settings;
        if s.request_timeout == 0 || s.streaming_idle_timeout == 0 || s.streaming_total_timeout == 0
        {
            return Err(Error::ConfigValidation(
                "timeouts must be positive".to_string(),
            ));
        }
        if s.unhealthy_threshold == 0 {
            return Err(Error::ConfigValidation(
                "unhealthy_threshold must be at least 1".to_string(),
            ));
        }
        for pattern in &s.unhealthy_response_body_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                Error::ConfigValidation(format!("invalid body pattern '{}': {}", pattern, e))
            })?;
        }
        if s.auth.enabled && s.auth.api_key.is_empty() {
            return Err(Error::ConfigValidation(
                "auth.enabled requires auth.api_key".to_string(),
            ));
        }

        Ok(())
    }
}

/// Substitute `${VAR}` references with environment variable values.
fn substitute_env(input: &str) -> Result<String> {
    static VAR: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern")
    });

    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in VAR.captures_iter(input) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps[1];
        out.push_str(&input[last..whole.start()]);
        let value = std::env::var(name)
            .map_err(|_| Error::Config(format!("environment variable '{}' is not set", name)))?;
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

/// Shared handle to the current snapshot.
///
/// Readers clone the inner `Arc` and keep it for the whole request; reload
/// swaps the pointer under a short write lock.
pub struct ConfigHandle {
    path: PathBuf,
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl ConfigHandle {
    /// Load the initial snapshot from a file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = Self::read_snapshot(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Build a handle around an in-memory snapshot (tests, embedded use).
    pub fn from_snapshot(snapshot: ConfigSnapshot) -> Self {
        Self {
            path: PathBuf::new(),
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Current snapshot. Cheap; clones an `Arc`.
    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Reparse the config file and atomically swap the snapshot. On any
    /// error the running snapshot is left untouched.
    pub fn reload(&self) -> Result<()> {
        let snapshot = Self::read_snapshot(&self.path)?;
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(snapshot);
        tracing::info!(path = %self.path.display(), "configuration reloaded");
        Ok(())
    }

    fn read_snapshot(path: &Path) -> Result<ConfigSnapshot> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        ConfigSnapshot::from_yaml(&contents)
    }
}
