//! Shared application state

use nimbus_core::config::ConfigHandle;
use nimbus_egress::ClientPool;
use nimbus_oauth::OAuthManager;
use nimbus_routing::{HealthRegistry, RoundRobinState, StickyProvider};
use nimbus_stream::DedupRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Everything the handlers need, shared behind one `Arc`.
///
/// The config handle hands out immutable snapshots; all other members carry
/// their own interior locking, so handlers never take a state-wide lock.
pub struct AppState {
    pub config: ConfigHandle,
    pub health: HealthRegistry,
    pub sticky: StickyProvider,
    pub round_robin: RoundRobinState,
    pub dedup: Arc<DedupRegistry>,
    pub oauth: Arc<OAuthManager>,
    pub clients: ClientPool,
    pub limits: ConnectionLimits,
}

impl AppState {
    pub fn new(config: ConfigHandle, oauth: Arc<OAuthManager>) -> Arc<Self> {
        Arc::new(Self {
            config,
            health: HealthRegistry::new(),
            sticky: StickyProvider::new(),
            round_robin: RoundRobinState::new(),
            dedup: DedupRegistry::new(),
            oauth,
            clients: ClientPool::default(),
            limits: ConnectionLimits::new(),
        })
    }
}

/// Per-provider bound on concurrent upstream calls.
///
/// A semaphore is created lazily per provider with the limit in force at
/// first use; excess callers queue rather than open new connections. Permits
/// are held for the whole upstream call (until terminal status for streams).
pub struct ConnectionLimits {
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConnectionLimits {
    pub fn new() -> Self {
        Self {
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, provider: &str, max: usize) -> OwnedSemaphorePermit {
        let semaphore = {
            let mut guard = self.semaphores.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(
                guard
                    .entry(provider.to_string())
                    .or_insert_with(|| Arc::new(Semaphore::new(max.max(1)))),
            )
        };
        semaphore
            .acquire_owned()
            .await
            .expect("connection semaphore is never closed")
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self::new()
    }
}
