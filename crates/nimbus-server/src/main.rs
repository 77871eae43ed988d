//! Nimbus — an Anthropic Messages reverse proxy with provider failover
//!
//! Usage:
//! ```bash
//! nimbus-server --config config.yaml --listen 127.0.0.1:9090
//! ```
//!
//! Exit codes: 0 normal shutdown, 1 config parse error, 2 bind failure.

use clap::Parser;
use nimbus_core::config::ConfigHandle;
use nimbus_oauth::{EncryptedFileStore, MemoryStore, OAuthConfig, OAuthManager, SecretStore};
use nimbus_server::{build_router, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Nimbus provider balancer
#[derive(Parser)]
#[command(name = "nimbus-server")]
#[command(about = "Anthropic Messages reverse proxy with health-driven provider failover", long_about = None)]
struct Cli {
    /// Listen address
    #[arg(short, long, value_name = "ADDR", env = "NIMBUS_LISTEN", default_value = "127.0.0.1:9090")]
    listen: SocketAddr,

    /// Path to the YAML configuration file
    #[arg(short, long, value_name = "FILE", env = "NIMBUS_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Log level filter (e.g. info, debug, nimbus_server=debug)
    #[arg(long, value_name = "LEVEL", env = "NIMBUS_LOG", default_value = "info")]
    log_level: String,

    /// Encrypted OAuth token store path (requires NIMBUS_TOKEN_KEY)
    #[arg(long, value_name = "FILE", env = "NIMBUS_TOKEN_STORE", default_value = "~/.nimbus/tokens.enc")]
    token_store: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match ConfigHandle::from_path(&cli.config) {
        Ok(handle) => handle,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn SecretStore> = match EncryptedFileStore::from_env(&cli.token_store) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(error = %e, "OAuth token persistence disabled, tokens held in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    let oauth = OAuthManager::new(OAuthConfig::default(), store);
    if let Err(e) = oauth.load_persisted() {
        warn!(error = %e, "failed to load persisted OAuth tokens");
    }

    let snapshot = config.load();
    info!(
        providers = snapshot.providers.len(),
        model_routes = snapshot.routes.len(),
        "configuration loaded"
    );
    drop(snapshot);

    let state = AppState::new(config, oauth);
    let router = build_router(state);

    let listener = match TcpListener::bind(cli.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %cli.listen, error = %e, "failed to bind listen address");
            std::process::exit(2);
        }
    };
    info!(addr = %cli.listen, "nimbus listening");

    if let Err(e) = axum::serve(listener, router).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
