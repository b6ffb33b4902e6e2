//! Test infrastructure for the hookwise webhook pipeline.
//!
//! Provides notification builders, recording handler doubles and a
//! [`TestEnv`] that assembles a complete pipeline with fast retry timings.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use hookwise_core::{LifecycleHandler, TestClock};
use hookwise_dispatch::{DeliveryMode, HandlerManager, PipelineConfig, RetryPolicy, WebhookPipeline};
use hookwise_ingest::{
    DeliveryCache, InMemoryDeliveryCache, SchemaRegistry, Validator, WebhookSecret,
    DEFAULT_RETENTION,
};

pub mod doubles;
pub mod fixtures;

pub use doubles::{
    Invocation, RecordingEventBus, RecordingHandler, RecordingLifecycle, Script,
    DEFAULT_WAIT_TIMEOUT,
};
pub use fixtures::{
    issues_payload, pull_request_payload, push_payload, NotificationBuilder, TEST_SECRET,
};

/// A started pipeline wired to recording doubles.
pub struct TestEnv {
    /// Pipeline under test.
    pub pipeline: Arc<WebhookPipeline>,
    /// Handler registry shared with the pipeline.
    pub manager: Arc<HandlerManager>,
    /// Delivery cache shared with the validator.
    pub cache: Arc<InMemoryDeliveryCache>,
    /// Receives every lifecycle event.
    pub lifecycle: Arc<RecordingLifecycle>,
    /// Clock driving cache expiry and timestamps.
    pub clock: TestClock,
}

impl TestEnv {
    /// Reliable pipeline with schema validation and millisecond retries.
    pub async fn new() -> Self {
        Self::builder().build().await
    }

    /// Starts configuring an environment.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::default()
    }
}

/// Configures a [`TestEnv`].
#[derive(Debug, Clone)]
pub struct TestEnvBuilder {
    config: PipelineConfig,
    attempt_timeout: Duration,
    schemas: bool,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            config: PipelineConfig {
                worker_count: 2,
                queue_capacity: 16,
                shutdown_timeout: Duration::from_secs(2),
                delivery_mode: DeliveryMode::Reliable,
                retry_policy: RetryPolicy::immediate(3),
                cache_gc_interval: None,
                release_exhausted_deliveries: false,
            },
            attempt_timeout: Duration::from_secs(1),
            schemas: true,
        }
    }
}

impl TestEnvBuilder {
    /// Replaces the pipeline configuration.
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Sets the delivery mode.
    #[must_use]
    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.config.delivery_mode = mode;
        self
    }

    /// Sets the per-handler timeout.
    #[must_use]
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Disables schema validation.
    #[must_use]
    pub fn without_schemas(mut self) -> Self {
        self.schemas = false;
        self
    }

    /// Builds and starts the pipeline.
    ///
    /// # Panics
    ///
    /// Panics if the pipeline fails to start.
    pub async fn build(self) -> TestEnv {
        let clock = TestClock::new();
        let cache =
            Arc::new(InMemoryDeliveryCache::new(DEFAULT_RETENTION, Arc::new(clock.clone())));
        let mut validator = Validator::new(
            WebhookSecret::new(fixtures::TEST_SECRET),
            cache.clone() as Arc<dyn DeliveryCache>,
        )
        .with_clock(Arc::new(clock.clone()));
        if self.schemas {
            validator = validator.with_schemas(SchemaRegistry::with_defaults());
        }

        let manager = Arc::new(HandlerManager::new(self.attempt_timeout));
        let lifecycle = RecordingLifecycle::new();

        let pipeline = WebhookPipeline::builder(self.config, Arc::new(validator), manager.clone())
            .lifecycle_handler(lifecycle.clone() as Arc<dyn LifecycleHandler>)
            .clock(Arc::new(clock.clone()))
            .build();
        pipeline.start().await.expect("pipeline starts");

        TestEnv { pipeline: Arc::new(pipeline), manager, cache, lifecycle, clock }
    }
}
