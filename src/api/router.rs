//! Router for the status endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get};
use tower::ServiceBuilder;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::handlers::{health_check_handler, liveness_handler, status_handler};
use crate::app::{AppState, ShutdownController};
use crate::domain::AppError;

/// Probes answered at once; the rest wait
const MAX_CONCURRENT_REQUESTS: usize = 32;

/// Create the status router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check_handler))
        .route("/health/live", get(liveness_handler))
        .route("/status", get(status_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS)),
        )
        .with_state(state)
}

/// Serve the status router until shutdown is triggered
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: ShutdownController,
) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        AppError::Internal(format!("Failed to bind status server on {}: {}", addr, e))
    })?;
    info!(%addr, "Status server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            shutdown.triggered().await;
        })
        .await
        .map_err(|e| AppError::Internal(format!("Status server failed: {}", e)))
}
