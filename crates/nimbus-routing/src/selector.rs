//! Provider selection
//!
//! Resolves a requested model through the ordered route patterns into a
//! ranked candidate list. Matching is case-insensitive first-match; `*` acts
//! as a wildcard, patterns without `*` match exactly.

use crate::health::{HealthRegistry, StickyProvider};
use nimbus_core::config::{ConfigSnapshot, ProviderConfig, SelectionStrategy, MODEL_PASSTHROUGH};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// One attemptable (provider, upstream model) pair
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: ProviderConfig,
    pub upstream_model: String,
    pub priority: u32,
}

/// Result of candidate selection. `NoRoute` and `AllUnhealthy` are distinct
/// so the caller can answer 404 vs 503.
#[derive(Debug)]
pub enum SelectionOutcome {
    /// No route pattern matched the requested model
    NoRoute,
    /// A route matched but every target is disabled, missing or cooling down
    AllUnhealthy,
    Candidates(Vec<Candidate>),
}

/// Per-pattern rotation counters for the round-robin strategy
pub struct RoundRobinState {
    counters: Mutex<HashMap<String, usize>>,
}

impl RoundRobinState {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn next(&self, pattern: &str, len: usize) -> usize {
        let mut guard = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        let counter = guard.entry(pattern.to_string()).or_insert(0);
        let index = *counter % len;
        *counter = counter.wrapping_add(1);
        index
    }
}

impl Default for RoundRobinState {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `model` matches a route `pattern` (case-insensitive, `*` wildcard).
pub fn matches_pattern(model: &str, pattern: &str) -> bool {
    let model = model.to_lowercase();
    let pattern = pattern.to_lowercase();

    if !pattern.contains('*') {
        return model == pattern;
    }

    let regex_pattern = format!(
        "^{}$",
        pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*")
    );
    match regex::Regex::new(&regex_pattern) {
        Ok(re) => re.is_match(&model),
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "invalid route pattern");
            false
        }
    }
}

/// Resolve candidates for a requested model.
pub fn select_candidates(
    requested_model: &str,
    snapshot: &ConfigSnapshot,
    health: &HealthRegistry,
    sticky: &StickyProvider,
    round_robin: &RoundRobinState,
) -> SelectionOutcome {
    let route = snapshot
        .routes
        .iter()
        .find(|route| matches_pattern(requested_model, &route.pattern));

    let Some(route) = route else {
        return SelectionOutcome::NoRoute;
    };

    let cooldown = Duration::from_secs(snapshot.settings.failure_cooldown);
    let mut candidates: Vec<Candidate> = Vec::new();
    for target in &route.targets {
        if !target.enabled {
            continue;
        }
        let Some(provider) = snapshot.provider(&target.provider) else {
            continue;
        };
        if !provider.enabled || !health.is_selectable(&provider.name, cooldown) {
            continue;
        }
        let upstream_model = if target.model == MODEL_PASSTHROUGH {
            requested_model.to_string()
        } else {
            target.model.clone()
        };
        candidates.push(Candidate {
            provider: provider.clone(),
            upstream_model,
            priority: target.priority,
        });
    }

    if candidates.is_empty() {
        return SelectionOutcome::AllUnhealthy;
    }

    candidates.sort_by_key(|c| c.priority);
    apply_strategy(
        &mut candidates,
        snapshot.settings.selection_strategy,
        &route.pattern,
        round_robin,
    );

    // Sticky promotion happens after strategy ordering.
    let window = Duration::from_secs(snapshot.settings.sticky_provider_duration);
    if let Some(sticky_name) = sticky.active(window) {
        if let Some(pos) = candidates
            .iter()
            .position(|c| c.provider.name == sticky_name)
        {
            let preferred = candidates.remove(pos);
            candidates.insert(0, preferred);
        }
    }

    SelectionOutcome::Candidates(candidates)
}

fn apply_strategy(
    candidates: &mut [Candidate],
    strategy: SelectionStrategy,
    pattern: &str,
    round_robin: &RoundRobinState,
) {
    let top_priority = candidates[0].priority;
    let band = candidates
        .iter()
        .take_while(|c| c.priority == top_priority)
        .count();
    if band <= 1 {
        return;
    }

    match strategy {
        SelectionStrategy::Priority => {}
        SelectionStrategy::RoundRobin => {
            let start = round_robin.next(pattern, band);
            candidates[..band].rotate_left(start);
        }
        SelectionStrategy::Random => {
            candidates[..band].shuffle(&mut rand::thread_rng());
        }
    }
}
