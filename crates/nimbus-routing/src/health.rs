//! Provider health engine
//!
//! Tracks per-provider error counters and unhealthy marking. A provider that
//! accumulates `unhealthy_threshold` qualifying failures without an
//! intervening success becomes unselectable for `failure_cooldown` seconds.
//! Cooldown expiry is lazy: selectability is recomputed on each selection, no
//! timer runs. Any success fully resets the counter and the unhealthy mark.

use nimbus_core::config::Settings;
use nimbus_core::{Error, TransportKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Why a failed attempt does (or does not) count against a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// HTTP status listed in `unhealthy_http_codes`
    HttpStatus(u16),
    /// Connect/read timeout, TLS or DNS failure, connection reset
    Transport(TransportKind),
    /// Decoded response body matched a configured pattern
    BodyPattern(String),
    /// Upstream emitted a terminal SSE error event
    SseError(String),
    /// Auth failures, validation errors, cancellations: surfaced verbatim,
    /// never counted, never retried
    NonQualifying(String),
}

impl FailureClass {
    pub fn is_qualifying(&self) -> bool {
        !matches!(self, FailureClass::NonQualifying(_))
    }

    /// Short reason string for logs and aggregated error messages.
    pub fn reason(&self) -> String {
        match self {
            FailureClass::HttpStatus(status) => format!("http_status_{}", status),
            FailureClass::Transport(kind) => format!("transport_{:?}", kind).to_lowercase(),
            FailureClass::BodyPattern(pattern) => format!("body_pattern_{}", pattern),
            FailureClass::SseError(error_type) => format!("sse_error_{}", error_type),
            FailureClass::NonQualifying(reason) => reason.clone(),
        }
    }
}

/// Classify a failed upstream attempt.
///
/// Three independent qualifying rules (any match counts):
/// status code list, transport exception class, body pattern match.
pub fn classify_error(error: &Error, settings: &Settings) -> FailureClass {
    match error {
        Error::UpstreamStatus { status, body } => {
            if settings.unhealthy_http_codes.contains(status) {
                return FailureClass::HttpStatus(*status);
            }
            if let Some(pattern) = match_body_patterns(body, settings) {
                return FailureClass::BodyPattern(pattern);
            }
            FailureClass::NonQualifying(format!("http_status_{}", status))
        }
        Error::Transport { kind, message } => {
            if kind.is_qualifying() {
                return FailureClass::Transport(*kind);
            }
            // Unrecognized transport errors still qualify when the message
            // matches a configured error-type substring.
            if let Some(pattern) = match_error_types(message, settings) {
                return FailureClass::BodyPattern(pattern);
            }
            FailureClass::NonQualifying("transport_other".to_string())
        }
        Error::Timeout(_) => FailureClass::Transport(TransportKind::ReadTimeout),
        Error::StreamError { error_type, .. } => FailureClass::SseError(error_type.clone()),
        Error::Stream(message) => FailureClass::SseError(message.clone()),
        other => FailureClass::NonQualifying(other.to_string()),
    }
}

/// Probe a decoded response body (success statuses included) for unhealthy
/// signals. Returns the matched pattern, if any.
pub fn classify_response_body(body: &str, settings: &Settings) -> Option<String> {
    // First 8 KiB only; error markers appear early.
    let preview = &body[..body.len().min(8 * 1024)];
    match_body_patterns(preview, settings)
}

fn match_body_patterns(body: &str, settings: &Settings) -> Option<String> {
    for pattern in &settings.unhealthy_response_body_patterns {
        match regex::RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(re) => {
                if re.is_match(body) {
                    return Some(pattern.clone());
                }
            }
            Err(_) => {
                // Patterns are validated at config load; fall back to a
                // substring check if one slips through.
                if body.to_lowercase().contains(&pattern.to_lowercase()) {
                    return Some(pattern.clone());
                }
            }
        }
    }
    match_error_types(body, settings)
}

fn match_error_types(text: &str, settings: &Settings) -> Option<String> {
    let lowered = text.to_lowercase();
    settings
        .unhealthy_error_types
        .iter()
        .find(|pattern| lowered.contains(&pattern.to_lowercase()))
        .cloned()
}

/// Mutable health state of one provider
#[derive(Debug, Default)]
struct HealthState {
    error_count: u32,
    last_error_time: Option<Instant>,
    unhealthy_since: Option<Instant>,
    last_success: Option<Instant>,
    last_success_unix: Option<u64>,
}

/// Point-in-time view for the `/providers` endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    pub name: String,
    pub error_count: u32,
    pub healthy: bool,
    /// Seconds since the provider was marked unhealthy, if it still is
    pub unhealthy_for_seconds: Option<u64>,
    /// Unix timestamp of the last successful call
    pub last_success: Option<u64>,
}

/// Registry of per-provider health state.
///
/// Each provider's state sits behind its own mutex; the registry map itself
/// is only write-locked when providers appear or disappear on reload.
pub struct HealthRegistry {
    providers: RwLock<HashMap<String, Arc<Mutex<HealthState>>>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
        }
    }

    fn state(&self, name: &str) -> Arc<Mutex<HealthState>> {
        if let Some(state) = self
            .providers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
        {
            return Arc::clone(state);
        }
        let mut guard = self.providers.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(guard.entry(name.to_string()).or_default())
    }

    /// Whether the provider may be handed new traffic.
    pub fn is_selectable(&self, name: &str, cooldown: Duration) -> bool {
        let state = self.state(name);
        let guard = state.lock().unwrap_or_else(|p| p.into_inner());
        match guard.unhealthy_since {
            None => true,
            Some(marked) => marked.elapsed() > cooldown,
        }
    }

    /// Record a successful call: reset the counter and the unhealthy mark.
    pub fn record_success(&self, name: &str) {
        let state = self.state(name);
        let mut guard = state.lock().unwrap_or_else(|p| p.into_inner());
        if guard.error_count > 0 {
            tracing::debug!(
                provider = name,
                old_count = guard.error_count,
                "error count reset after success"
            );
        }
        guard.error_count = 0;
        guard.unhealthy_since = None;
        guard.last_success = Some(Instant::now());
        guard.last_success_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs());
    }

    /// Record a failed call. Only qualifying classes count; returns whether
    /// this failure pushed the provider over the threshold.
    pub fn record_failure(&self, name: &str, class: &FailureClass, threshold: u32) -> bool {
        if !class.is_qualifying() {
            return false;
        }
        let state = self.state(name);
        let mut guard = state.lock().unwrap_or_else(|p| p.into_inner());
        guard.error_count += 1;
        guard.last_error_time = Some(Instant::now());

        tracing::debug!(
            provider = name,
            error_count = guard.error_count,
            threshold,
            reason = %class.reason(),
            "recorded provider error"
        );

        if guard.error_count >= threshold {
            let newly_marked = guard.unhealthy_since.is_none();
            guard.unhealthy_since = Some(Instant::now());
            if newly_marked {
                tracing::warn!(
                    provider = name,
                    error_count = guard.error_count,
                    reason = %class.reason(),
                    "provider marked unhealthy"
                );
            }
            true
        } else {
            false
        }
    }

    pub fn error_count(&self, name: &str) -> u32 {
        let state = self.state(name);
        let guard = state.lock().unwrap_or_else(|p| p.into_inner());
        guard.error_count
    }

    /// Snapshot one provider for the status endpoint.
    pub fn snapshot(&self, name: &str, cooldown: Duration) -> HealthSnapshot {
        let state = self.state(name);
        let guard = state.lock().unwrap_or_else(|p| p.into_inner());
        let healthy = match guard.unhealthy_since {
            None => true,
            Some(marked) => marked.elapsed() > cooldown,
        };
        HealthSnapshot {
            name: name.to_string(),
            error_count: guard.error_count,
            healthy,
            unhealthy_for_seconds: guard
                .unhealthy_since
                .filter(|_| !healthy)
                .map(|t| t.elapsed().as_secs()),
            last_success: guard.last_success_unix,
        }
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide preference for the most recently successful provider.
///
/// While the entry is younger than `sticky_provider_duration`, the selector
/// promotes that provider to the head of any candidate list it appears in.
pub struct StickyProvider {
    inner: Mutex<Option<(String, Instant)>>,
}

impl StickyProvider {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn record(&self, name: &str) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        *guard = Some((name.to_string(), Instant::now()));
    }

    /// Name of the sticky provider, if still inside its window.
    pub fn active(&self, window: Duration) -> Option<String> {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard
            .as_ref()
            .filter(|(_, set_at)| set_at.elapsed() <= window)
            .map(|(name, _)| name.clone())
    }
}

impl Default for StickyProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn test_threshold_marks_unhealthy() {
        let registry = HealthRegistry::new();
        let class = FailureClass::HttpStatus(500);

        assert!(!registry.record_failure("a", &class, 2));
        assert!(registry.is_selectable("a", Duration::from_secs(60)));
        assert_eq!(registry.error_count("a"), 1);

        assert!(registry.record_failure("a", &class, 2));
        assert!(!registry.is_selectable("a", Duration::from_secs(60)));
    }

    #[test]
    fn test_success_resets_even_mid_cooldown() {
        let registry = HealthRegistry::new();
        let class = FailureClass::HttpStatus(503);
        registry.record_failure("a", &class, 1);
        assert!(!registry.is_selectable("a", Duration::from_secs(60)));

        registry.record_success("a");
        assert!(registry.is_selectable("a", Duration::from_secs(60)));
        assert_eq!(registry.error_count("a"), 0);
    }

    #[test]
    fn test_cooldown_expiry_is_lazy() {
        let registry = HealthRegistry::new();
        let class = FailureClass::Transport(TransportKind::ConnectTimeout);
        registry.record_failure("a", &class, 1);

        assert!(!registry.is_selectable("a", Duration::from_millis(20)));
        std::thread::sleep(Duration::from_millis(30));
        assert!(registry.is_selectable("a", Duration::from_millis(20)));
    }

    #[test]
    fn test_non_qualifying_failures_do_not_count() {
        let registry = HealthRegistry::new();
        let class = FailureClass::NonQualifying("http_status_401".to_string());
        assert!(!registry.record_failure("a", &class, 1));
        assert_eq!(registry.error_count("a"), 0);
        assert!(registry.is_selectable("a", Duration::from_secs(60)));
    }

    #[test]
    fn test_classify_http_status() {
        let error = Error::UpstreamStatus {
            status: 500,
            body: "internal".to_string(),
        };
        assert_eq!(classify_error(&error, &settings()), FailureClass::HttpStatus(500));
    }

    #[test]
    fn test_classify_auth_status_non_qualifying() {
        let error = Error::UpstreamStatus {
            status: 401,
            body: "unauthorized".to_string(),
        };
        let class = classify_error(&error, &settings());
        assert!(!class.is_qualifying());
    }

    #[test]
    fn test_classify_body_pattern_on_unlisted_status() {
        let error = Error::UpstreamStatus {
            status: 418,
            body: "monthly quota exhausted".to_string(),
        };
        match classify_error(&error, &settings()) {
            FailureClass::BodyPattern(pattern) => assert_eq!(pattern, "quota"),
            other => panic!("expected body pattern, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_transport_kinds() {
        let error = Error::Transport {
            kind: TransportKind::DnsFailure,
            message: "dns".to_string(),
        };
        assert_eq!(
            classify_error(&error, &settings()),
            FailureClass::Transport(TransportKind::DnsFailure)
        );

        let timeout = Error::Timeout(30);
        assert_eq!(
            classify_error(&timeout, &settings()),
            FailureClass::Transport(TransportKind::ReadTimeout)
        );
    }

    #[test]
    fn test_classify_sse_error() {
        let error = Error::StreamError {
            error_type: "overloaded_error".to_string(),
            message: "overloaded".to_string(),
        };
        match classify_error(&error, &settings()) {
            FailureClass::SseError(t) => assert_eq!(t, "overloaded_error"),
            other => panic!("expected sse error, got {:?}", other),
        }
    }

    #[test]
    fn test_response_body_probe_regex() {
        let mut s = settings();
        s.unhealthy_response_body_patterns = vec!["\"error\"\\s*:\\s*\\{".to_string()];
        let body = r#"{"error": {"type": "overloaded_error"}}"#;
        assert!(classify_response_body(body, &s).is_some());
        assert!(classify_response_body(r#"{"content": []}"#, &s).is_none());
    }

    #[test]
    fn test_response_body_probe_substring() {
        let body = r#"{"message": "Rate limit reached for requests"}"#;
        assert_eq!(
            classify_response_body(body, &settings()),
            Some("rate limit".to_string())
        );
    }

    #[test]
    fn test_sticky_window() {
        let sticky = StickyProvider::new();
        assert!(sticky.active(Duration::from_secs(300)).is_none());

        sticky.record("primary");
        assert_eq!(
            sticky.active(Duration::from_secs(300)),
            Some("primary".to_string())
        );
        assert!(sticky.active(Duration::from_millis(0)).is_none());
    }

    #[test]
    fn test_snapshot_fields() {
        let registry = HealthRegistry::new();
        registry.record_success("a");
        let snap = registry.snapshot("a", Duration::from_secs(60));
        assert!(snap.healthy);
        assert_eq!(snap.error_count, 0);
        assert!(snap.last_success.is_some());

        registry.record_failure("a", &FailureClass::HttpStatus(502), 1);
        let snap = registry.snapshot("a", Duration::from_secs(60));
        assert!(!snap.healthy);
        assert!(snap.unhealthy_for_seconds.is_some());
    }
}
