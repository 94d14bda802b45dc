use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, extract::WebSocketUpgrade, routing::get};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use super::coordinator::{Coordinator, CoordinatorConfig};
use super::db::{DbHandle, QueueDb};
use super::github::{GitHubNotifier, LogNotifier, Notifier};
use super::provider::HttpStatusProvider;
use super::store::PhaseQueueStore;
use super::ws::{self, WsBroadcaster};
use crate::config::PhaseQueueConfig;

/// GitHub notification target resolved from config and environment.
#[derive(Debug, Clone)]
pub struct GitHubTarget {
    pub api_base: String,
    pub repo: String,
    pub token: String,
}

/// Configuration for the phasequeue server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub max_chain_length: usize,
    pub provider_url: Option<String>,
    pub github: Option<GitHubTarget>,
    pub coordinator: CoordinatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3142,
            db_path: PathBuf::from(".phasequeue/queue.db"),
            dev_mode: false,
            max_chain_length: super::store::DEFAULT_MAX_CHAIN_LENGTH,
            provider_url: None,
            github: None,
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &PhaseQueueConfig) -> Self {
        let toml = &config.toml;
        let github = match (toml.github.repo.clone(), config.github_token()) {
            (Some(repo), Some(token)) => Some(GitHubTarget {
                api_base: toml.github.api_base.clone(),
                repo,
                token,
            }),
            _ => None,
        };
        Self {
            host: toml.server.host.clone(),
            port: toml.server.port,
            db_path: config.db_path().to_path_buf(),
            dev_mode: toml.server.dev_mode,
            max_chain_length: config.max_chain_length(),
            provider_url: config.provider_url().map(String::from),
            github,
            coordinator: config.coordinator_config(),
        }
    }
}

/// Open (creating if needed) the queue database and wrap it in a store.
pub fn open_store(db_path: &std::path::Path, max_chain_length: usize) -> Result<PhaseQueueStore> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = QueueDb::new(db_path).context("Failed to initialize queue database")?;
    Ok(PhaseQueueStore::new(DbHandle::new(db), max_chain_length))
}

/// GitHub when fully configured, else log-only.
pub fn build_notifier(github: Option<&GitHubTarget>) -> Result<Arc<dyn Notifier>> {
    match github {
        Some(target) => {
            let notifier = GitHubNotifier::new(&target.api_base, &target.repo, &target.token)?;
            info!(repo = notifier.owner_repo(), "posting phase notifications to GitHub");
            Ok(Arc::new(notifier))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}

/// Wire a coordinator with the HTTP status provider and configured notifier.
pub fn build_coordinator(
    config: &ServerConfig,
    store: PhaseQueueStore,
    broadcaster: WsBroadcaster,
) -> Result<Coordinator> {
    let provider_url = config.provider_url.as_deref().context(
        "No status provider configured. Set [provider] base_url or PHASEQUEUE_PROVIDER_URL",
    )?;
    let notifier = build_notifier(config.github.as_ref())?;
    Ok(Coordinator::new(
        store,
        Arc::new(HttpStatusProvider::new(provider_url)),
        Arc::new(broadcaster),
        notifier,
        config.coordinator.clone(),
    ))
}

/// Build the full application router with API and WebSocket.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_tx = state.broadcaster.sender();

    api::api_router()
        .route(
            "/ws",
            get(move |ws_upgrade: WebSocketUpgrade| {
                ws::ws_handler_with_sender(ws_upgrade, ws_tx.clone())
            }),
        )
        .with_state(state)
}

/// Run the HTTP API and the coordinator until Ctrl-C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let store = open_store(&config.db_path, config.max_chain_length)?;
    let broadcaster = WsBroadcaster::new();
    let coordinator = Arc::new(build_coordinator(
        &config,
        store.clone(),
        broadcaster.clone(),
    )?);

    let state = Arc::new(AppState {
        store,
        broadcaster,
        coordinator: coordinator.clone(),
    });

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;

    coordinator.start();
    info!(%local_addr, db = %config.db_path.display(), "phasequeue listening");
    println!("phasequeue running at http://{}", local_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    coordinator.stop().await;
    println!("Server shut down gracefully.");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C; shutting down");
    }
    info!("shutdown requested");
}
