//! Shared HTTP client utilities
//!
//! Upstream calls reuse one `reqwest::Client` per `(base_url, proxy)` pair so
//! connection pools survive across requests. Per-request deadlines are
//! enforced by the orchestrator with explicit timers, so clients only carry a
//! connect timeout.

use crate::{EgressError, Result};
use reqwest::{Client, ClientBuilder};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Maximum number of idle connections per host
    pub pool_max_idle_per_host: usize,

    /// User agent string
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            pool_max_idle_per_host: 32,
            user_agent: format!("Nimbus/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Create a configured HTTP client with connection pooling.
pub fn create_client(config: &HttpClientConfig, proxy: Option<&str>) -> Result<Client> {
    let mut builder = ClientBuilder::new()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .user_agent(&config.user_agent)
        .use_rustls_tls();

    if let Some(proxy_url) = proxy {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| EgressError::Config(format!("invalid proxy '{}': {}", proxy_url, e)))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| EgressError::Config(format!("failed to create HTTP client: {}", e)))
}

/// Pool of HTTP clients keyed by `(base_url, proxy)`
pub struct ClientPool {
    config: HttpClientConfig,
    clients: Mutex<HashMap<(String, Option<String>), Client>>,
}

impl ClientPool {
    pub fn new(config: HttpClientConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch (or lazily create) the client for an upstream.
    pub fn get(&self, base_url: &str, proxy: Option<&str>) -> Result<Client> {
        let key = (base_url.to_string(), proxy.map(String::from));
        let mut guard = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let client = create_client(&self.config, proxy)?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new(HttpClientConfig::default())
    }
}
