//! Proxy server assembly and lifecycle

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::auth::AuthGate;
use super::router::{AppState, create_router};
use super::session::SessionManager;
use crate::active_set::{ActiveSet, ChangeEvent, ChangeNotifier};
use crate::client::McpConnector;
use crate::config::Settings;
use crate::config_store::{ConfigStore, ConfigWatcher};
use crate::dispatch::Dispatcher;
use crate::embeddings::EmbeddingsClient;
use crate::registry::Registry;
use crate::{Error, Result};

/// The aggregated MCP proxy server
pub struct ProxyServer {
    settings: Settings,
    active: Arc<ActiveSet>,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionManager>,
}

impl ProxyServer {
    /// Assemble the proxy from settings
    ///
    /// # Errors
    ///
    /// Returns an error when the embeddings client cannot be built.
    pub fn new(settings: Settings) -> Result<Self> {
        let embedder = EmbeddingsClient::from_settings(&settings.search)?;
        if embedder.is_none() {
            info!("No embeddings key configured; search_mcps uses keyword fallback");
        }

        let registry = Arc::new(Registry::new(
            settings.paths.catalog_path.clone(),
            settings.paths.index_path.clone(),
            settings.paths.cache_ttl,
            embedder,
        ));

        let store = ConfigStore::new(settings.paths.config_path.clone());
        let active = Arc::new(ActiveSet::new(
            settings.cache.max_live,
            settings.cache.request_timeout,
            Arc::new(McpConnector),
            Arc::clone(&registry),
            store,
            ChangeNotifier::new(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&active),
            Arc::clone(&registry),
            settings.search.default_limit,
        ));

        let sessions = Arc::new(SessionManager::new(settings.server.keep_server_open));

        Ok(Self {
            settings,
            active,
            dispatcher,
            sessions,
        })
    }

    /// Run until SIGINT/SIGTERM
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot bind or the server fails.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.settings
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.settings.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        // Warm the persisted active set before accepting traffic
        let store = ConfigStore::new(self.settings.paths.config_path.clone());
        match store.load() {
            Ok(config) if !config.servers.is_empty() => {
                info!(
                    servers = config.servers.len(),
                    "Restoring persisted active set"
                );
                self.active.reload_from_disk(&config).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Could not read persisted active set; starting empty");
            }
        }

        // Watch the config path for external edits
        let (watcher, mut config_rx) = ConfigWatcher::start(
            self.settings.paths.config_path.clone(),
            shutdown_tx.subscribe(),
        )?;
        let active_for_reload = Arc::clone(&self.active);
        tokio::spawn(async move {
            while let Some(config) = config_rx.recv().await {
                active_for_reload.reload_from_disk(&config).await;
            }
        });

        // Forward change events to the live session
        let mut change_rx = self.active.notifier().subscribe();
        let sessions_for_events = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            loop {
                match change_rx.recv().await {
                    Ok(ChangeEvent::ToolListChanged) => {
                        sessions_for_events.notify(json!({
                            "jsonrpc": "2.0",
                            "method": "notifications/tools/list_changed"
                        }));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        });

        let state = Arc::new(AppState {
            dispatcher: Arc::clone(&self.dispatcher),
            sessions: Arc::clone(&self.sessions),
            active: Arc::clone(&self.active),
            auth: Arc::new(AuthGate::from_settings(&self.settings)),
            keep_alive: self.settings.server.keep_alive_interval,
            resource_url: self.settings.resource_url(),
        });
        let app = create_router(state);

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("MCP PROXY ROUTER v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.settings.server.host, port = self.settings.server.port, "Listening");
        info!("  MCP endpoint:  {}", self.settings.resource_url());
        info!(
            "  Live ceiling:  {} backend(s)",
            self.settings.cache.max_live
        );
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        // Stop accepting, close the session, then close every backend
        watcher.stop();
        self.sessions.clear();
        info!("Shutting down backends...");
        self.active.shutdown().await;

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
