//! HTTP surface and configuration for the hookwise webhook pipeline.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use hookwise_core::Clock;
use hookwise_dispatch::WebhookPipeline;

pub mod config;
pub mod handlers;
pub mod server;

pub use config::{Config, IngestMode};
pub use handlers::{
    health::{HealthResponse, HealthStatus},
    ingest::{IngestResponse, IngestStatus},
    ErrorDetail, ErrorResponse,
};
pub use server::{create_router, shutdown_signal, start_server, WEBHOOK_ROUTE};

/// State shared by all request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Pipeline receiving webhooks.
    pub pipeline: Arc<WebhookPipeline>,
    /// How requests hand notifications to the pipeline.
    pub ingest_mode: IngestMode,
    /// Largest body read from a request.
    pub max_payload_bytes: usize,
    /// Source of response timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// State for `pipeline` configured from `config`.
    pub fn new(pipeline: Arc<WebhookPipeline>, config: &Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            pipeline,
            ingest_mode: config.ingest_mode,
            max_payload_bytes: config.max_payload_bytes,
            clock,
        }
    }
}
