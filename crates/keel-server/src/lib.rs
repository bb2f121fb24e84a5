pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::path::PathBuf;
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        // Attempts
        .route(
            "/api/attempts",
            get(routes::attempts::list_attempts).post(routes::attempts::create_attempt),
        )
        .route("/api/attempts/{id}", get(routes::attempts::get_attempt))
        .route(
            "/api/attempts/{id}/approval",
            post(routes::approvals::submit_approval),
        )
        .route(
            "/api/attempts/{id}/cancel",
            post(routes::attempts::cancel_attempt),
        )
        .route("/api/attempts/{id}/audit", get(routes::attempts::get_audit))
        // Audit chain
        .route("/api/audit/verify", get(routes::attempts::verify_audit))
        // Targets
        .route("/api/targets", get(routes::targets::list_targets))
        .route(
            "/api/targets/{name}/repair",
            post(routes::targets::repair_target),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

/// Open the project, settle attempts a previous process left mid-flight,
/// and serve the API on `addr` until the future is dropped.
pub async fn serve(root: PathBuf, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(root, listener).await
}

/// Like `serve`, on a pre-bound listener (port 0 lets the OS pick).
pub async fn serve_on(root: PathBuf, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let app_state = AppState::open(&root)?;

    // The database lock is exclusive, so nothing else can be driving these.
    let settled = app_state.machine.recover(chrono::Duration::zero()).await?;
    if !settled.is_empty() {
        tracing::warn!(count = settled.len(), "settled interrupted attempts on startup");
    }

    let actual = listener.local_addr()?;
    tracing::info!("keel API listening on http://{actual}");

    axum::serve(listener, build_router(app_state)).await?;
    Ok(())
}
