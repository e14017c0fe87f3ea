use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use ctxcache_settings::CacheSettings;
use ctxcache_store::{ContextStore, StoreConfig, Sweeper};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::connection;
use crate::event_bridge;
use crate::handlers;
use crate::hub::SubscriptionHub;
use crate::stats::ServerStats;

/// Request bodies may exceed the payload limit by this much to allow for the envelope.
const BODY_LIMIT_SLACK: usize = 64 * 1024;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub store: StoreConfig,
    /// Rendered by `/metrics/prometheus` when present.
    pub prometheus: Option<PrometheusHandle>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_send_queue: 256,
            store: StoreConfig::default(),
            prometheus: None,
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_send_queue: settings.server.max_send_queue,
            store: StoreConfig::from(&settings.store),
            prometheus: None,
        }
    }

    pub fn with_prometheus(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.prometheus = handle;
        self
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ContextStore>,
    pub hub: Arc<SubscriptionHub>,
    pub stats: Arc<ServerStats>,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(store: Arc<ContextStore>, max_send_queue: usize, prometheus: Option<PrometheusHandle>) -> Self {
        let hub = Arc::new(SubscriptionHub::new(Arc::clone(&store), max_send_queue));
        Self {
            store,
            hub,
            stats: Arc::new(ServerStats::new()),
            prometheus,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state
        .store
        .config()
        .max_context_size
        .saturating_add(BODY_LIMIT_SLACK);

    Router::new()
        .route(
            "/context/{id}",
            get(handlers::get_context)
                .put(handlers::put_context)
                .delete(handlers::delete_context),
        )
        .route("/context/{id}/diff", post(handlers::post_diff))
        .route("/metrics", get(handlers::metrics_json))
        .route("/metrics/prometheus", get(handlers::prometheus_metrics))
        .route("/health", get(handlers::health))
        .route("/ws", get(connection::ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), handlers::count_requests))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind the listener and start the server, event bridge and sweeper.
pub async fn start(config: ServerConfig) -> Result<ServerHandle, std::io::Error> {
    let store = Arc::new(ContextStore::new(config.store.clone()));
    let state = AppState::new(Arc::clone(&store), config.max_send_queue, config.prometheus.clone());
    let cancel = CancellationToken::new();

    let bridge = event_bridge::spawn(Arc::clone(&state.hub), store.subscribe_events(), cancel.clone());
    let sweeper = Sweeper::new(Arc::clone(&store)).spawn(cancel.clone());

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        max_versions = config.store.max_versions,
        max_contexts = config.store.max_contexts,
        token_budget = config.store.token_budget,
        "context cache listening"
    );

    let router = build_router(state.clone());
    let stop = cancel.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        local_addr,
        state,
        cancel,
        server,
        bridge,
        sweeper,
    })
}

/// Handle returned by `start()`; owns the background tasks.
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: AppState,
    cancel: CancellationToken,
    server: JoinHandle<()>,
    bridge: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting requests, close every push channel and wait for the
    /// background tasks.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let closed = self.state.hub.close_all();
        tracing::info!(closed_channels = closed, "shutting down");

        let tasks = futures::future::join_all([self.server, self.bridge, self.sweeper]);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, tasks).await.is_err() {
            tracing::warn!("shutdown timed out after {SHUTDOWN_TIMEOUT:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = start(ServerConfig::default()).await.unwrap();
        assert!(handle.port() > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");

        handle.shutdown().await;
    }

    #[test]
    fn config_from_settings() {
        let mut settings = CacheSettings::default();
        settings.server.port = 7001;
        settings.store.max_versions = 4;
        let config = ServerConfig::from_settings(&settings);
        assert_eq!(config.port, 7001);
        assert_eq!(config.store.max_versions, 4);
        assert!(config.prometheus.is_none());
    }

    #[test]
    fn build_router_creates_routes() {
        let state = AppState::new(Arc::new(ContextStore::new(StoreConfig::default())), 8, None);
        let _router = build_router(state);
    }
}
