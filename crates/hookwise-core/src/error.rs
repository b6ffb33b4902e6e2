//! Error taxonomy for the webhook pipeline.
//!
//! Every failure the pipeline surfaces to a caller or operator is one of the
//! coded variants below. Codes are stable so callers can disambiguate
//! without parsing messages, and each variant belongs to exactly one
//! [`ErrorClass`] that decides whether it is retried.

use std::fmt;

use thiserror::Error;

/// Result type alias using [`HookwiseError`].
pub type Result<T> = std::result::Result<T, HookwiseError>;

/// Pipeline error with a stable code.
#[derive(Debug, Clone, Error)]
pub enum HookwiseError {
    // Malformed requests (E1001-E1007)
    /// Required transport headers are missing (E1001).
    #[error("[E1001] Invalid headers: missing {}", missing.join(", "))]
    InvalidHeaders {
        /// Names of the missing headers
        missing: Vec<String>,
    },

    /// Payload signature did not verify (E1002).
    #[error("[E1002] Invalid signature: {reason}")]
    InvalidSignature {
        /// Why verification failed
        reason: String,
    },

    /// Delivery identifier was already processed (E1003).
    #[error("[E1003] Duplicate delivery: {delivery_id} already processed")]
    DuplicateDelivery {
        /// The replayed delivery identifier
        delivery_id: String,
    },

    /// Payload violates the registered schema (E1004).
    #[error("[E1004] Schema violation for {event_type}: {}", violations.join("; "))]
    SchemaViolation {
        /// Event type whose schema was applied
        event_type: String,
        /// Each violated constraint
        violations: Vec<String>,
    },

    /// Source address is outside the allowlist (E1005).
    #[error("[E1005] Source not allowed: {address}")]
    SourceNotAllowed {
        /// The rejected source address
        address: String,
    },

    /// Payload exceeds the configured size limit (E1006).
    #[error("[E1006] Payload too large: {size_bytes} bytes exceeds {limit_bytes} byte limit")]
    PayloadTooLarge {
        /// Size of the payload in bytes
        size_bytes: usize,
        /// Configured limit in bytes
        limit_bytes: usize,
    },

    /// Payload could not be parsed into an event (E1007).
    #[error("[E1007] Malformed payload: {message}")]
    MalformedPayload {
        /// Parse failure description
        message: String,
    },

    // Processing (E2001-E2002)
    /// One or more matching handlers failed (E2001).
    #[error("[E2001] Handler failed: {failed} of {matched} handlers failed for {delivery_id}")]
    HandlerFailed {
        /// Delivery being dispatched
        delivery_id: String,
        /// Handlers that matched the event
        matched: usize,
        /// Handlers that returned an error
        failed: usize,
    },

    /// Retries were exhausted (E2002).
    #[error("[E2002] Retries exhausted: {delivery_id} failed after {attempts} attempts")]
    RetriesExhausted {
        /// Delivery that was given up on
        delivery_id: String,
        /// Total attempts made
        attempts: u32,
    },

    // Resource exhaustion and internal (E3001-E3004)
    /// Inbound queue is at capacity (E3001).
    #[error("[E3001] Queue full: {capacity} notifications pending")]
    QueueFull {
        /// Queue capacity
        capacity: usize,
    },

    /// Pipeline no longer accepts work (E3002).
    #[error("[E3002] Pipeline closed: not accepting new notifications")]
    PipelineClosed,

    /// Delivery cache backend failed (E3003).
    #[error("[E3003] Delivery cache unavailable: {message}")]
    CacheUnavailable {
        /// Backend failure description
        message: String,
    },

    /// Unexpected internal failure (E3004).
    #[error("[E3004] Internal error: {message}")]
    Internal {
        /// Failure description
        message: String,
    },
}

/// How a failure is handled by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Sender error or attack; rejected and never retried.
    MalformedRequest,
    /// Handler failure; retried with backoff.
    Transient,
    /// Retries exhausted; terminal.
    Exhausted,
    /// Capacity reached; surfaced so the caller applies backpressure.
    ResourceExhausted,
    /// Pipeline fault requiring operator attention.
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedRequest => write!(f, "malformed_request"),
            Self::Transient => write!(f, "transient"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::ResourceExhausted => write!(f, "resource_exhausted"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

impl HookwiseError {
    /// Creates an internal error from any message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Returns the stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidHeaders { .. } => "E1001",
            Self::InvalidSignature { .. } => "E1002",
            Self::DuplicateDelivery { .. } => "E1003",
            Self::SchemaViolation { .. } => "E1004",
            Self::SourceNotAllowed { .. } => "E1005",
            Self::PayloadTooLarge { .. } => "E1006",
            Self::MalformedPayload { .. } => "E1007",
            Self::HandlerFailed { .. } => "E2001",
            Self::RetriesExhausted { .. } => "E2002",
            Self::QueueFull { .. } => "E3001",
            Self::PipelineClosed => "E3002",
            Self::CacheUnavailable { .. } => "E3003",
            Self::Internal { .. } => "E3004",
        }
    }

    /// Returns the handling class of this error.
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidHeaders { .. }
            | Self::InvalidSignature { .. }
            | Self::DuplicateDelivery { .. }
            | Self::SchemaViolation { .. }
            | Self::SourceNotAllowed { .. }
            | Self::PayloadTooLarge { .. }
            | Self::MalformedPayload { .. } => ErrorClass::MalformedRequest,
            Self::HandlerFailed { .. } => ErrorClass::Transient,
            Self::RetriesExhausted { .. } => ErrorClass::Exhausted,
            Self::QueueFull { .. } | Self::PipelineClosed => ErrorClass::ResourceExhausted,
            Self::CacheUnavailable { .. } | Self::Internal { .. } => ErrorClass::Internal,
        }
    }

    /// Returns whether the pipeline retries this error locally.
    ///
    /// Resource exhaustion is not retried here; the caller retries.
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(HookwiseError::InvalidHeaders { missing: vec![] }.code(), "E1001");
        assert_eq!(HookwiseError::InvalidSignature { reason: String::new() }.code(), "E1002");
        assert_eq!(HookwiseError::DuplicateDelivery { delivery_id: "d".into() }.code(), "E1003");
        assert_eq!(HookwiseError::QueueFull { capacity: 1 }.code(), "E3001");
        assert_eq!(HookwiseError::PipelineClosed.code(), "E3002");
    }

    #[test]
    fn only_handler_failures_are_retried() {
        let handler_failed =
            HookwiseError::HandlerFailed { delivery_id: "d".into(), matched: 2, failed: 1 };
        assert!(handler_failed.is_retryable());

        assert!(!HookwiseError::InvalidSignature { reason: "mismatch".into() }.is_retryable());
        assert!(!HookwiseError::DuplicateDelivery { delivery_id: "d".into() }.is_retryable());
        assert!(!HookwiseError::QueueFull { capacity: 10 }.is_retryable());
        assert!(!HookwiseError::RetriesExhausted { delivery_id: "d".into(), attempts: 6 }
            .is_retryable());
    }

    #[test]
    fn messages_carry_codes_and_context() {
        let err = HookwiseError::InvalidHeaders {
            missing: vec!["x-github-event".into(), "x-hub-signature-256".into()],
        };
        assert_eq!(
            err.to_string(),
            "[E1001] Invalid headers: missing x-github-event, x-hub-signature-256"
        );

        let err = HookwiseError::SchemaViolation {
            event_type: "push".into(),
            violations: vec!["/ref: required property missing".into()],
        };
        assert!(err.to_string().contains("/ref: required property missing"));
        assert_eq!(err.class(), ErrorClass::MalformedRequest);
    }
}
