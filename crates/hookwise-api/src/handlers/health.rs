//! Health and liveness endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use hookwise_dispatch::PipelineStats;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Registered handlers
    pub handlers: usize,
    /// Pipeline counters
    pub pipeline: PipelineStats,
    /// Service version information
    pub version: String,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Accepting and processing webhooks
    Healthy,
    /// Pipeline has shut down
    ShuttingDown,
}

/// Health check endpoint handler.
///
/// Reports pipeline counters. Answers 503 once the pipeline stops accepting
/// work so load balancers drain the instance.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let status = if state.pipeline.is_closed() {
        HealthStatus::ShuttingDown
    } else {
        HealthStatus::Healthy
    };

    let response = HealthResponse {
        status,
        timestamp: state.clock.now(),
        handlers: state.pipeline.manager().len().await,
        pipeline: state.pipeline.stats().await,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    debug!(status = ?response.status, queued = response.pipeline.queued, "Health check completed");

    let status_code = match status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response)).into_response()
}

/// Liveness check endpoint.
///
/// Only tells whether the HTTP server is responding.
#[instrument(name = "liveness_check", skip(state))]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now(),
        "service": "hookwise"
    });

    (StatusCode::OK, Json(response)).into_response()
}
