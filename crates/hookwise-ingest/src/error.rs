//! Validation error types.
//!
//! Every variant describes a request the pipeline refuses outright. None of
//! them is retried: they indicate an attack, a misconfigured sender or a
//! replay, all of which need an operator rather than another attempt.

use std::net::IpAddr;

use hookwise_core::{DeliveryId, HookwiseError};
use thiserror::Error;

use crate::{crypto::SignatureError, delivery_cache::CacheError};

/// Result type for validation operations.
pub type Result<T> = std::result::Result<T, ValidationError>;

/// Reasons a notification is rejected.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    /// Payload is larger than the configured limit.
    #[error("payload of {size_bytes} bytes exceeds the {limit_bytes} byte limit")]
    PayloadTooLarge {
        /// Payload size in bytes.
        size_bytes: usize,
        /// Configured limit in bytes.
        limit_bytes: usize,
    },

    /// Source address is outside every allowed range.
    #[error("source address {address} is not in an allowed range")]
    SourceNotAllowed {
        /// Rejected address.
        address: IpAddr,
    },

    /// Required headers are missing.
    #[error("missing required headers: {}", missing.join(", "))]
    InvalidHeaders {
        /// Names of the missing headers.
        missing: Vec<String>,
    },

    /// Signature did not verify.
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    /// Delivery identifier was seen within the retention window.
    #[error("delivery {delivery_id} was already processed")]
    DuplicateDelivery {
        /// Replayed identifier.
        delivery_id: DeliveryId,
    },

    /// Payload violates the schema registered for its event type.
    #[error("payload violates the {event_type} schema: {}", violations.join("; "))]
    SchemaViolation {
        /// Event type whose schema was applied.
        event_type: String,
        /// Violated constraints.
        violations: Vec<String>,
    },

    /// Delivery cache backend failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl From<ValidationError> for HookwiseError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::PayloadTooLarge { size_bytes, limit_bytes } => {
                Self::PayloadTooLarge { size_bytes, limit_bytes }
            },
            ValidationError::SourceNotAllowed { address } => {
                Self::SourceNotAllowed { address: address.to_string() }
            },
            ValidationError::InvalidHeaders { missing } => Self::InvalidHeaders { missing },
            ValidationError::InvalidSignature(e) => {
                Self::InvalidSignature { reason: e.to_string() }
            },
            ValidationError::DuplicateDelivery { delivery_id } => {
                Self::DuplicateDelivery { delivery_id: delivery_id.to_string() }
            },
            ValidationError::SchemaViolation { event_type, violations } => {
                Self::SchemaViolation { event_type, violations }
            },
            ValidationError::Cache(e) => e.into(),
        }
    }
}
