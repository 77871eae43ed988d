//! Nimbus server library
//!
//! Exposes the router assembly and shared state so integration tests can run
//! the full HTTP surface in-process; the binary in `main.rs` wires the same
//! pieces behind the CLI.

pub mod admin;
pub mod app;
pub mod errors;
pub mod pipeline;
pub mod state;

pub use app::build_router;
pub use state::AppState;
