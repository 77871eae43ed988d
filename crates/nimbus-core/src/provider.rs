//! Provider trait definitions

use crate::{
    normalized::{NormalizedRequest, NormalizedResponse, NormalizedStreamEvent},
    Result,
};
use futures::Stream;

/// Boxed stream of normalized events from an upstream
pub type EventStream = Box<dyn Stream<Item = Result<NormalizedStreamEvent>> + Send + Unpin>;

/// A single upstream endpoint that can answer normalized requests.
///
/// Implemented by the egress connectors; the orchestrator constructs one per
/// attempt with the candidate's resolved credentials.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Send a non-streaming request
    async fn send(&self, request: NormalizedRequest) -> Result<NormalizedResponse>;

    /// Send a streaming request
    async fn stream(&self, request: NormalizedRequest) -> Result<EventStream>;
}
