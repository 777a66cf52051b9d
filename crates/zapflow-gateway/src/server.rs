//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{get, post},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use zapflow_channels::{ChannelRegistry, Gateways, spawn_health_monitor};
use zapflow_core::config::ZapflowConfig;
use zapflow_dispatch::{
    DeliveryLog, DispatchEngine, HttpVariator, Humanizer, InMemoryProgressStore, PacingConfig, ProgressStore,
    SqliteDeliveryLog, SynonymVariator, Variator, spawn_progress_sweeper,
};

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DispatchEngine>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(engine: Arc<DispatchEngine>) -> Self {
        Self {
            engine,
            start_time: std::time::Instant::now(),
        }
    }

    /// Wire registry, adapters, progress store and variator from config.
    /// `history_db` is the already expanded delivery-log path, if any.
    pub fn from_config(config: &ZapflowConfig, history_db: Option<PathBuf>) -> anyhow::Result<Self> {
        let registry = Arc::new(ChannelRegistry::new(
            Gateways::from_config(&config.http),
            config.dispatch.max_consecutive_failures,
        ));
        for channel in config.channels() {
            registry.register(channel);
        }

        let progress: Arc<dyn ProgressStore> = Arc::new(InMemoryProgressStore::new());
        let variator: Arc<dyn Variator> = match HttpVariator::from_config(&config.variator) {
            Some(http) => Arc::new(http),
            None => Arc::new(SynonymVariator::new()),
        };

        let mut engine = DispatchEngine::new(registry, progress)
            .with_humanizer(Humanizer::from_config(&config.dispatch))
            .with_variator(variator)
            .with_default_pacing(PacingConfig::from_defaults(&config.dispatch));

        if let Some(path) = history_db {
            match SqliteDeliveryLog::open(&path) {
                Ok(log) => {
                    tracing::info!("🗄️ Delivery log: {}", path.display());
                    let log: Arc<dyn DeliveryLog> = Arc::new(log);
                    engine = engine.with_history(log);
                }
                Err(e) => tracing::warn!("⚠️ Delivery log disabled ({}): {e}", path.display()),
            }
        }

        Ok(Self::new(Arc::new(engine)))
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let cors = CorsLayer::new()
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST, axum::http::Method::OPTIONS])
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600));
    let cors = match std::env::var("ZAPFLOW_CORS_ORIGINS") {
        Ok(origins) => cors.allow_origin(
            origins
                .split(',')
                .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ),
        Err(_) => cors.allow_origin(Any),
    };

    Router::new()
        .route("/api/v1/health", get(super::routes::health_check))
        .route(
            "/api/v1/progress",
            get(super::routes::get_progress).post(super::routes::post_progress),
        )
        .route(
            "/api/v1/dispatch",
            get(super::routes::list_dispatches).post(super::routes::submit_dispatch),
        )
        .route("/api/v1/dispatch/{session_id}", get(super::routes::dispatch_status))
        .route("/api/v1/dispatch/{session_id}/stop", post(super::routes::stop_dispatch))
        .route("/api/v1/channels", get(super::routes::list_channels))
        .route("/api/v1/channels/{id}/refresh", post(super::routes::refresh_channel))
        .route("/api/v1/channels/{id}/reconnect", post(super::routes::reconnect_channel))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start background loops and serve until the process is stopped.
pub async fn start(config: &ZapflowConfig, state: AppState) -> anyhow::Result<()> {
    let engine = state.engine.clone();
    let _health = spawn_health_monitor(engine.registry().clone(), config.dispatch.health_check_interval_secs);
    let _sweeper = spawn_progress_sweeper(engine.progress().clone(), config.dispatch.progress_ttl_secs);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        "🌐 Zapflow API listening on http://{} ({} channels)",
        addr,
        engine.registry().len()
    );
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
