//! Nimbus Stream
//!
//! In-flight request sharing:
//! - [`broadcaster`] fans one upstream SSE stream out to any number of
//!   subscribers with full backlog replay and timeout enforcement.
//! - [`dedup`] maps request fingerprints to in-flight entries so duplicate
//!   calls collapse onto one upstream request.

pub mod broadcaster;
pub mod dedup;

pub use broadcaster::{BroadcastOptions, Broadcaster, Subscription, Terminal};
pub use dedup::{BeginStream, BeginUnary, DedupRegistry, UnaryOutcome};
