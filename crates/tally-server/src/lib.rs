//! # tally-server
//!
//! HTTP surface for Tally.
//!
//! Generation endpoints run one workflow per request and answer with a short-lived
//! download link (or the file itself for `-direct`). Failures answer with the run's
//! `debug_id` and links to whatever diagnostics were captured. A background task
//! purges expired download tokens.

mod error;
mod handlers;
mod state;
mod sweeper;

pub use error::{ApiError, DebugLinks, FailureResponse};
pub use handlers::{GenerateReportBody, ReportResponse, SessionCookiesBody};
pub use state::{AppState, CookieService, SharedState};
pub use sweeper::spawn_sweeper;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tally_browser::SessionLauncher;
use tally_core::{CancellationToken, TallyConfig};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// All routes over `state`
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/generate-report", post(handlers::generate_report))
        .route("/get-report-default", get(handlers::report_default))
        .route("/get-report-default-direct", get(handlers::report_default_direct))
        .route("/download/:file_id", get(handlers::download))
        .route("/debug", get(handlers::list_debug))
        .route("/debug/:debug_id", get(handlers::show_debug))
        .route("/files/:dir/:file", get(handlers::debug_file))
        .route("/session-cookies", post(handlers::session_cookies))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until Ctrl-C, then stop the sweeper. Artifacts stay on disk.
pub async fn serve(config: TallyConfig, launcher: Arc<dyn SessionLauncher>) -> anyhow::Result<()> {
    let state = Arc::new(AppState::from_config(&config, launcher)?);
    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(state.registry.clone(), config.registry.clone(), shutdown.clone());

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Tally listening on http://{}", addr);
    info!("Public base URL: {}", state.base_url);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!("Registry sweeper ended abnormally: {}", e);
    }
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
