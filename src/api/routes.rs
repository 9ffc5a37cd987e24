//! API route definitions

use crate::config::GatewayConfig;
use crate::coordinator::SwitchCoordinator;
use crate::health::HttpHealthProbe;
use crate::models::{DownloadManager, HubClient, ModelCatalog};
use crate::process::SystemProcessManager;
use crate::router::{
    CHAT_COMPLETIONS, COMPLETIONS, EMBEDDINGS, IMAGE_GENERATIONS, RESPONSES, RequestRouter,
    TRANSCRIPTIONS, TRANSLATIONS,
};
use crate::supervisor::BackendSupervisor;
use anyhow::{Context, Result};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Audio uploads can be large
const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<RequestRouter>,
    pub catalog: Arc<ModelCatalog>,
    pub hub: Arc<HubClient>,
    pub downloads: DownloadManager,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

impl AppState {
    /// Wire up the gateway components for a validated configuration
    pub async fn build(
        config: &GatewayConfig,
        prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
    ) -> Result<Self> {
        let catalog = Arc::new(ModelCatalog::new(&config.models_dir, config.vram_headroom));
        let models = catalog
            .refresh()
            .await
            .with_context(|| format!("Failed to scan models directory {:?}", config.models_dir))?;
        tracing::info!(dir = ?config.models_dir, models, "Model catalog loaded");

        let supervisor = Arc::new(BackendSupervisor::new(
            config,
            Arc::new(SystemProcessManager::new()),
            Arc::new(HttpHealthProbe::new()?),
        ));
        let coordinator =
            SwitchCoordinator::new(supervisor, config.auto_switch, config.switch_timeout());
        let router = Arc::new(RequestRouter::new(coordinator, catalog.clone(), config)?);

        let hub = Arc::new(HubClient::new(&config.hub_endpoint, config.hf_token.clone())?);
        let downloads = DownloadManager::new(
            catalog.clone(),
            hub.clone(),
            config.max_concurrent_downloads,
            Duration::from_millis(config.download_progress_interval_ms),
        )?;

        Ok(Self {
            router,
            catalog,
            hub,
            downloads,
            prometheus_handle,
        })
    }

    pub fn coordinator(&self) -> &SwitchCoordinator {
        self.router.coordinator()
    }
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/status", get(handlers::status))
        .route("/ui/gpu", get(handlers::gpu_info))
        // OpenAI-compatible inference
        .route("/v1/models", get(handlers::list_models))
        .route(CHAT_COMPLETIONS, post(handlers::inference))
        .route(COMPLETIONS, post(handlers::inference))
        .route(EMBEDDINGS, post(handlers::inference))
        .route(RESPONSES, post(handlers::inference))
        .route(IMAGE_GENERATIONS, post(handlers::inference))
        .route(TRANSCRIPTIONS, post(handlers::transcriptions))
        .route(TRANSLATIONS, post(handlers::translations))
        // Backend administration
        .route("/ui/backends", get(handlers::list_backends))
        .route("/ui/backends/stop", post(handlers::stop_backends))
        .route("/ui/backends/{kind}/activate", post(handlers::activate_backend))
        // Model management
        .route("/ui/models/search", get(handlers::search_models))
        .route("/ui/models/files", get(handlers::list_repo_files))
        .route(
            "/ui/models/local",
            get(handlers::list_local_models).delete(handlers::delete_local_model),
        )
        .route(
            "/ui/models/download",
            get(handlers::list_downloads)
                .post(handlers::start_download)
                .delete(handlers::prune_downloads),
        )
        .route(
            "/ui/models/download/{id}",
            get(handlers::download_status).delete(handlers::cancel_download),
        )
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
