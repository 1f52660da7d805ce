//! HTTP server implementation using Axum.

use crate::handlers::{self, handle_health, require_api_key};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use localai_core::{CancellationToken, LocalAiApi};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Application state shared across handlers.
pub struct AppState {
    pub api: LocalAiApi,
    /// Keys accepted on protected routes; empty disables the check.
    pub api_keys: Vec<String>,
    pub opaque_errors: bool,
}

impl AppState {
    pub fn new(api: LocalAiApi) -> Self {
        let config = api.config();
        Self {
            api_keys: config.api_keys.clone(),
            opaque_errors: config.opaque_errors,
            api,
        }
    }
}

/// Build the router. Health routes stay open when API keys are set.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        // Models
        .route("/models/available", get(handlers::list_models))
        .route("/models/apply", post(handlers::apply_model))
        .route("/models/delete/:name", post(handlers::delete_model))
        .route("/models/jobs", get(handlers::jobs))
        .route("/models/jobs/:uuid", get(handlers::job_status))
        .route("/models/jobs/:uuid/cancel", post(handlers::cancel_job))
        .route("/models/processing", get(handlers::processing))
        .route("/models", get(handlers::installed_models))
        // Backends
        .route("/backends/available", get(handlers::list_backends))
        .route("/backends/apply", post(handlers::apply_backend))
        .route("/backends/delete/:name", post(handlers::delete_backend))
        .route("/backends/jobs/:uuid", get(handlers::job_status))
        .route("/backends", get(handlers::installed_backends))
        .route("/backend/monitor", get(handlers::loaded_models))
        .route("/backend/shutdown", post(handlers::shutdown_backend))
        // P2P
        .route("/api/p2p", get(handlers::p2p_nodes))
        .route("/api/p2p/token", get(handlers::p2p_token))
        .route("/api/p2p/expose", post(handlers::expose_service))
        .route("/api/p2p/ledger/:bucket", get(handlers::ledger_bucket))
        .route("/api/p2p/ledger/:bucket/:key", get(handlers::ledger_value))
        // System
        .route("/system", get(handlers::system_info))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/healthz", get(handle_health))
        .route("/readyz", get(handle_health))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Start the HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
/// The server drains and stops once `cancel` fires.
pub async fn start_server(
    api: LocalAiApi,
    address: &str,
    cancel: CancellationToken,
) -> anyhow::Result<SocketAddr> {
    let app = router(Arc::new(AppState::new(api)));

    let addr: SocketAddr = address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("HTTP server error: {}", e);
        }
    });

    Ok(actual_addr)
}
