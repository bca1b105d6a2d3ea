//! HTTP handlers for the status endpoints.

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{error, warn};

use crate::app::{AppState, RuntimeSnapshot};
use crate::domain::{
    AppError, ChainError, DatabaseError, ErrorDetail, ErrorResponse, ExternalServiceError,
    HealthResponse, HealthStatus, QueueError,
};

/// Runtime status of this process
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub process_id: i32,
    pub shutting_down: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_reason: Option<String>,
    #[serde(flatten)]
    pub runtime: RuntimeSnapshot,
}

/// Health check endpoint
///
/// Returns 503 while the database is unreachable.
pub async fn health_check_handler(State(state): State<Arc<AppState>>) -> Response {
    let database = match state.store.health_check().await {
        Ok(()) => HealthStatus::Healthy,
        Err(e) => {
            warn!(error = %e, "Database health check failed");
            HealthStatus::Unhealthy
        }
    };
    let mut health = HealthResponse::new(database);
    if database == HealthStatus::Healthy && state.shutdown.is_triggered() {
        health.status = HealthStatus::Degraded;
    }

    let code = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(health)).into_response()
}

/// Liveness probe
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Scheduler or consumer counters
pub async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        process_id: state.process_id,
        shutting_down: state.shutdown.is_triggered(),
        shutdown_reason: state.shutdown.reason().map(|r| r.to_string()),
        runtime: state.runtime.snapshot(),
    })
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::Database(db_err) => match db_err {
                DatabaseError::Connection(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "database_error",
                    self.to_string(),
                ),
                DatabaseError::NotFound(_) => {
                    (StatusCode::NOT_FOUND, "not_found", self.to_string())
                }
                DatabaseError::Duplicate(_) => {
                    (StatusCode::CONFLICT, "duplicate", self.to_string())
                }
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    self.to_string(),
                ),
            },
            AppError::Chain(chain_err) => match chain_err {
                ChainError::NodeUnavailable(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "chain_error",
                    self.to_string(),
                ),
                ChainError::Timeout(_) => {
                    (StatusCode::GATEWAY_TIMEOUT, "timeout", self.to_string())
                }
                _ => (StatusCode::BAD_GATEWAY, "chain_error", self.to_string()),
            },
            AppError::Queue(queue_err) => match queue_err {
                QueueError::Malformed { .. } => {
                    (StatusCode::BAD_REQUEST, "malformed_message", self.to_string())
                }
                _ => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "queue_error",
                    self.to_string(),
                ),
            },
            AppError::ExternalService(ext_err) => match ext_err {
                ExternalServiceError::Timeout(_) => {
                    (StatusCode::GATEWAY_TIMEOUT, "timeout", self.to_string())
                }
                _ => (
                    StatusCode::BAD_GATEWAY,
                    "external_service_error",
                    self.to_string(),
                ),
            },
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "configuration_error",
                self.to_string(),
            ),
            AppError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "validation_error",
                self.to_string(),
            ),
            AppError::Consistency(_) => (
                StatusCode::CONFLICT,
                "consistency_error",
                self.to_string(),
            ),
            AppError::Serialization(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "serialization_error",
                self.to_string(),
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                self.to_string(),
            ),
            AppError::NotSupported(_) => (
                StatusCode::NOT_IMPLEMENTED,
                "not_supported",
                self.to_string(),
            ),
        };

        if status.is_server_error() {
            error!(error_type = %error_type, message = %message, "Server error");
        }

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                r#type: error_type.to_string(),
                message,
            },
        });
        (status, body).into_response()
    }
}
