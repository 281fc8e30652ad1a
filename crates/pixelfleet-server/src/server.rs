use crate::handlers::{jobs, ops, process};
use axum::routing::{delete, get, post};
use axum::Router;
use pixelfleet_common::error::{FleetError, Result};
use pixelfleet_engine::Engine;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Builds the full northbound router.
pub fn build_router(engine: Arc<Engine>) -> Router {
    Router::new()
        // processing
        .route("/api/remove-background", post(process::remove_background))
        .route("/api/upscale-image", post(process::upscale_image))
        .route("/api/upscale-remove-bg", post(process::upscale_remove_bg))
        .route("/api/async/{kind}", post(process::submit_async))
        // job tracking
        .route("/api/jobs/list", get(jobs::list))
        .route("/api/jobs/cleanup", post(jobs::cleanup))
        .route("/api/jobs/stats", get(jobs::stats))
        .route("/api/jobs/{id}/status", get(jobs::status))
        .route("/api/jobs/{id}/result", get(jobs::result))
        .route("/api/jobs/{id}", delete(jobs::delete))
        // operational
        .route("/health", get(ops::health))
        .route("/status", get(ops::status))
        .route("/status/metrics", get(ops::metrics))
        .route("/api/metrics", get(ops::metrics))
        .route("/api/circuit-breakers", get(ops::breakers))
        .route("/api/circuit-breakers/{name}/open", post(ops::breaker_open))
        .route("/api/circuit-breakers/{name}/close", post(ops::breaker_close))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

/// Binds and serves until the token is cancelled.
pub async fn serve(
    engine: Arc<Engine>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = build_router(engine);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| FleetError::Transport(format!("failed to bind {addr}: {e}")))?;
    let local = listener
        .local_addr()
        .map_err(|e| FleetError::Transport(format!("failed to read local addr: {e}")))?;
    info!("pixelfleet listening on {local}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| FleetError::Transport(format!("server error: {e}")))?;
    Ok(())
}
