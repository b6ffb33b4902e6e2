//! Error types for dispatch, retry and worker pool operations.

use std::time::Duration;

use hookwise_core::{DeliveryId, HandlerId, HookwiseError};
use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Failures of the registry, retry manager and worker pool.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// A handler with this identifier is already registered.
    #[error("handler {handler_id} is already registered")]
    DuplicateHandler {
        /// Conflicting identifier
        handler_id: HandlerId,
    },

    /// No handler with this identifier is registered.
    #[error("handler {handler_id} is not registered")]
    HandlerNotFound {
        /// Unknown identifier
        handler_id: HandlerId,
    },

    /// The delivery already has an active retry record.
    #[error("delivery {delivery_id} already has an active retry")]
    AlreadyScheduled {
        /// Delivery identifier
        delivery_id: DeliveryId,
    },

    /// The delivery has no active retry record.
    #[error("no active retry for delivery {delivery_id}")]
    RetryNotFound {
        /// Delivery identifier
        delivery_id: DeliveryId,
    },

    /// The retry record is not in a state that allows the operation.
    #[error("retry for {delivery_id} is {state}, cannot {operation}")]
    InvalidRetryState {
        /// Delivery identifier
        delivery_id: DeliveryId,
        /// Current state name
        state: String,
        /// Rejected operation
        operation: &'static str,
    },

    /// The inbound queue is at capacity.
    #[error("queue full: {capacity} notifications pending")]
    QueueFull {
        /// Queue capacity
        capacity: usize,
    },

    /// The pipeline or retry manager no longer accepts work.
    #[error("pipeline closed")]
    PipelineClosed,

    /// Shutdown did not finish within its budget.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Budget that was exceeded
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker index
        worker_id: usize,
        /// Panic description
        error: String,
    },

    /// Retry store backend failed.
    #[error("retry store error: {message}")]
    Store {
        /// Backend failure description
        message: String,
    },
}

impl DispatchError {
    /// Creates a retry store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into() }
    }
}

impl From<DispatchError> for HookwiseError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::QueueFull { capacity } => Self::QueueFull { capacity },
            DispatchError::PipelineClosed => Self::PipelineClosed,
            other => Self::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use hookwise_core::ErrorClass;

    use super::*;

    #[test]
    fn capacity_errors_map_to_resource_exhaustion() {
        let err: HookwiseError = DispatchError::QueueFull { capacity: 8 }.into();
        assert_eq!(err.class(), ErrorClass::ResourceExhausted);
        assert_eq!(err.code(), "E3001");

        let err: HookwiseError = DispatchError::PipelineClosed.into();
        assert_eq!(err.code(), "E3002");
    }

    #[test]
    fn registry_errors_are_internal() {
        let err: HookwiseError =
            DispatchError::DuplicateHandler { handler_id: HandlerId::from("h1") }.into();
        assert_eq!(err.class(), ErrorClass::Internal);
        assert!(err.to_string().contains("h1"));
    }
}
