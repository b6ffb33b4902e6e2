//! GitHub webhook ingestion.
//!
//! The body is read as raw bytes because the signature covers them exactly.
//! Depending on [`IngestMode`] the notification is either validated within
//! the request or queued for a worker and acknowledged straight away.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::CONTENT_LENGTH, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hookwise_core::{HookwiseError, InboundNotification};
use hookwise_dispatch::Routed;
use serde::{Deserialize, Serialize};
use tracing::{debug, field, info, instrument, warn};

use super::error_response;
use crate::{AppState, IngestMode};

/// Response to an accepted webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Provider-assigned delivery id
    pub delivery_id: String,
    /// What happened to the notification
    pub status: IngestStatus,
}

/// Outcome reported for an accepted webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// Waiting in the inbound queue; not validated yet.
    Queued,
    /// Validated and handed to the retry manager.
    Scheduled,
    /// Validated and dispatched to every matching handler.
    Dispatched,
}

/// Ingests a GitHub webhook.
///
/// # Errors
///
/// Returns appropriate HTTP status codes:
/// - 400: Missing headers, schema violation or malformed payload
/// - 401: Signature mismatch
/// - 403: Source address outside the allowlist
/// - 409: Delivery id already processed
/// - 413: Payload too large
/// - 503: Queue full or shutting down, with `Retry-After`
/// - 500: Handler failure in direct mode or internal errors
#[instrument(
    name = "ingest_webhook",
    skip(state, request),
    fields(delivery_id = field::Empty, event_type = field::Empty)
)]
pub async fn ingest_webhook(State(state): State<AppState>, request: Request) -> Response {
    let source = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0.ip());
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, state.max_payload_bytes).await {
        Ok(body) => body,
        Err(e) => {
            let size_bytes = parts
                .headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(state.max_payload_bytes.saturating_add(1));
            warn!(
                size_bytes,
                limit = state.max_payload_bytes,
                error = %e,
                "Failed to read payload within size limit"
            );
            return error_response(&HookwiseError::PayloadTooLarge {
                size_bytes,
                limit_bytes: state.max_payload_bytes,
            });
        },
    };

    let notification = InboundNotification::from_http(parts.headers, body, state.clock.now());
    let delivery_id = notification.delivery_id.to_string();
    let span = tracing::Span::current();
    span.record("delivery_id", delivery_id.as_str());
    span.record("event_type", notification.event_type.as_str());
    debug!(bytes = notification.raw_payload.len(), "Webhook received");

    let status = match state.ingest_mode {
        IngestMode::Queued => {
            state.pipeline.enqueue(notification, source).map(|()| IngestStatus::Queued)
        },
        IngestMode::Immediate => match state.pipeline.submit(notification, source).await {
            Ok(Routed::Scheduled) => Ok(IngestStatus::Scheduled),
            Ok(Routed::Dispatched(report)) => match report.into_error() {
                None => Ok(IngestStatus::Dispatched),
                Some(e) => Err(e),
            },
            Err(e) => Err(e),
        },
    };

    match status {
        Ok(status) => {
            info!(status = ?status, "Webhook accepted");
            (StatusCode::ACCEPTED, Json(IngestResponse { delivery_id, status })).into_response()
        },
        Err(e) => {
            debug!(code = e.code(), error = %e, "Webhook not accepted");
            error_response(&e)
        },
    }
}
