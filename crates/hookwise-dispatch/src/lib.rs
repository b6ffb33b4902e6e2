//! Dispatch side of the hookwise webhook pipeline.
//!
//! Accepted notifications flow from a bounded queue through a fixed pool of
//! ingest workers, which validate, parse and route them. In reliable mode
//! the [`RetryManager`] dispatches each event to the handlers registered in
//! the [`HandlerManager`] and retries failed dispatches with exponential
//! backoff until they succeed or run out of attempts.
//!
//! [`WebhookPipeline`] ties the pieces together and owns their shutdown.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod manager;
pub mod pipeline;
pub mod publisher;
pub mod retry;
pub mod retry_manager;
pub mod worker;
pub mod worker_pool;

pub use error::{DispatchError, Result};
pub use manager::{
    handler_fn, DispatchReport, FnHandler, HandlerManager, HandlerOutcome, RegistrationInfo,
    WebhookHandler, DEFAULT_ATTEMPT_TIMEOUT,
};
pub use pipeline::{PipelineBuilder, PipelineConfig, WebhookPipeline};
pub use publisher::{register_default_handlers, EventBusHandler};
pub use retry::{RetryDecision, RetryPolicy};
pub use retry_manager::{
    InMemoryRetryStore, RetryManager, RetryOptions, RetryQuery, RetryRecord, RetryState,
    RetryStats, RetryStore,
};
pub use worker::{DeliveryMode, PipelineStats, QueuedNotification, Routed};
pub use worker_pool::WorkerPool;
