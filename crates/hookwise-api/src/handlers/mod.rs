//! HTTP request handlers.
//!
//! Every failure leaves the API as `{"error": {"code", "message"}}` with a
//! status derived from the error's code, so senders can tell a rejected
//! request from backpressure.

pub mod health;
pub mod ingest;

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hookwise_core::HookwiseError;
use serde::Serialize;

pub use health::{health_check, liveness_check};
pub use ingest::ingest_webhook;

/// Seconds a sender should wait after backpressure.
const RETRY_AFTER_SECS: &str = "5";

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Error code from the taxonomy (E1001-E3004)
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// HTTP status for a pipeline error.
pub fn status_for(error: &HookwiseError) -> StatusCode {
    match error {
        HookwiseError::InvalidHeaders { .. }
        | HookwiseError::SchemaViolation { .. }
        | HookwiseError::MalformedPayload { .. } => StatusCode::BAD_REQUEST,
        HookwiseError::InvalidSignature { .. } => StatusCode::UNAUTHORIZED,
        HookwiseError::SourceNotAllowed { .. } => StatusCode::FORBIDDEN,
        HookwiseError::DuplicateDelivery { .. } => StatusCode::CONFLICT,
        HookwiseError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        HookwiseError::QueueFull { .. } | HookwiseError::PipelineClosed => {
            StatusCode::SERVICE_UNAVAILABLE
        },
        HookwiseError::HandlerFailed { .. }
        | HookwiseError::RetriesExhausted { .. }
        | HookwiseError::CacheUnavailable { .. }
        | HookwiseError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Renders `error` as a JSON response.
pub fn error_response(error: &HookwiseError) -> Response {
    let status = status_for(error);
    let body = ErrorResponse {
        error: ErrorDetail { code: error.code().to_string(), message: error.to_string() },
    };

    let mut response = (status, Json(body)).into_response();
    if status == StatusCode::SERVICE_UNAVAILABLE {
        response.headers_mut().insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_error_codes() {
        let cases = [
            (HookwiseError::InvalidHeaders { missing: vec![] }, StatusCode::BAD_REQUEST),
            (HookwiseError::InvalidSignature { reason: "x".into() }, StatusCode::UNAUTHORIZED),
            (HookwiseError::SourceNotAllowed { address: "10.0.0.9".into() }, StatusCode::FORBIDDEN),
            (HookwiseError::DuplicateDelivery { delivery_id: "d".into() }, StatusCode::CONFLICT),
            (
                HookwiseError::PayloadTooLarge { size_bytes: 2, limit_bytes: 1 },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (HookwiseError::QueueFull { capacity: 1 }, StatusCode::SERVICE_UNAVAILABLE),
            (HookwiseError::PipelineClosed, StatusCode::SERVICE_UNAVAILABLE),
            (HookwiseError::internal("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, status) in cases {
            assert_eq!(status_for(&error), status, "{error}");
        }
    }

    #[test]
    fn backpressure_sets_retry_after() {
        let response = error_response(&HookwiseError::QueueFull { capacity: 4 });
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), RETRY_AFTER_SECS);

        let duplicate = HookwiseError::DuplicateDelivery { delivery_id: "d".into() };
        let response = error_response(&duplicate);
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }
}
