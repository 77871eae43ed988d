//! Nimbus Routing
//!
//! Health-driven provider selection:
//! - [`health`] tracks per-provider error counters, unhealthy marking with
//!   cooldown, and classifies failures into qualifying / non-qualifying.
//! - [`selector`] resolves a requested model to an ordered candidate list,
//!   applying the configured strategy and the sticky-provider preference.

pub mod health;
pub mod selector;

pub use health::{
    classify_error, classify_response_body, FailureClass, HealthRegistry, HealthSnapshot,
    StickyProvider,
};
pub use selector::{select_candidates, Candidate, RoundRobinState, SelectionOutcome};
