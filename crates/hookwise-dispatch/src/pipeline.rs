//! Webhook pipeline wiring the queue, workers, retries and cache sweeper.

use std::{
    fmt,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock as StdRwLock,
    },
    time::Duration,
};

use hookwise_core::{
    Clock, HookwiseError, InboundNotification, LifecycleHandler, NoOpLifecycleHandler, RealClock,
};
use hookwise_ingest::{DeliveryCache, Validator};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{DispatchError, Result},
    manager::HandlerManager,
    retry::RetryPolicy,
    retry_manager::{InMemoryRetryStore, RetryManager, RetryOptions, RetryStore},
    worker::{DeliveryMode, PipelineStats, Processor, QueuedNotification, Routed},
    worker_pool::WorkerPool,
};

/// Pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrent ingest workers.
    pub worker_count: usize,

    /// Inbound queue capacity; enqueue fails with `QueueFull` beyond it.
    pub queue_capacity: usize,

    /// Total budget for [`WebhookPipeline::shutdown`].
    pub shutdown_timeout: Duration,

    /// How accepted events reach handlers.
    pub delivery_mode: DeliveryMode,

    /// Backoff applied in reliable mode.
    pub retry_policy: RetryPolicy,

    /// Interval between delivery cache sweeps. `None` disables sweeping.
    pub cache_gc_interval: Option<Duration>,

    /// Release exhausted deliveries from the delivery cache so a provider
    /// redelivery is admitted again.
    pub release_exhausted_deliveries: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 100,
            shutdown_timeout: Duration::from_secs(5),
            delivery_mode: DeliveryMode::Reliable,
            retry_policy: RetryPolicy::default(),
            cache_gc_interval: Some(Duration::from_secs(600)),
            release_exhausted_deliveries: false,
        }
    }
}

/// Builder for [`WebhookPipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    validator: Arc<Validator>,
    manager: Arc<HandlerManager>,
    lifecycle: Arc<dyn LifecycleHandler>,
    retry_store: Arc<dyn RetryStore>,
    clock: Arc<dyn Clock>,
}

impl PipelineBuilder {
    /// Receives rejection, success, retry and exhaustion events.
    #[must_use]
    pub fn lifecycle_handler(mut self, lifecycle: Arc<dyn LifecycleHandler>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Replaces the in-memory retry record store.
    #[must_use]
    pub fn retry_store(mut self, store: Arc<dyn RetryStore>) -> Self {
        self.retry_store = store;
        self
    }

    /// Clock for lifecycle and record timestamps.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Assembles the pipeline. Nothing runs until
    /// [`WebhookPipeline::start`].
    pub fn build(self) -> WebhookPipeline {
        let Self { config, validator, manager, lifecycle, retry_store, clock } = self;

        let mut retry_options = RetryOptions::new(config.retry_policy.clone(), manager.clone())
            .with_lifecycle_handler(lifecycle.clone())
            .with_store(retry_store)
            .with_clock(clock.clone());
        if config.release_exhausted_deliveries {
            retry_options =
                retry_options.releasing_exhausted_from(validator.delivery_cache().clone());
        }
        let retry_manager = Arc::new(RetryManager::new(retry_options));

        let stats = Arc::new(RwLock::new(PipelineStats::default()));
        let processor = Arc::new(Processor {
            validator: validator.clone(),
            manager: manager.clone(),
            retry_manager: retry_manager.clone(),
            mode: config.delivery_mode,
            lifecycle,
            stats: stats.clone(),
            clock,
        });

        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));

        WebhookPipeline {
            config,
            validator,
            manager,
            retry_manager,
            processor,
            sender: StdRwLock::new(Some(sender)),
            receiver: Arc::new(Mutex::new(receiver)),
            worker_pool: Mutex::new(None),
            sweeper: Mutex::new(None),
            stats,
            cancellation_token: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

/// Inbound webhook pipeline.
///
/// Notifications enter through [`WebhookPipeline::enqueue`] (bounded queue,
/// processed by workers) or [`WebhookPipeline::submit`] (processed on the
/// caller's task). Both paths validate, parse and route identically.
pub struct WebhookPipeline {
    config: PipelineConfig,
    validator: Arc<Validator>,
    manager: Arc<HandlerManager>,
    retry_manager: Arc<RetryManager>,
    processor: Arc<Processor>,
    sender: StdRwLock<Option<mpsc::Sender<QueuedNotification>>>,
    receiver: Arc<Mutex<mpsc::Receiver<QueuedNotification>>>,
    worker_pool: Mutex<Option<WorkerPool>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RwLock<PipelineStats>>,
    cancellation_token: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
}

impl WebhookPipeline {
    /// Starts building a pipeline around `validator` and `manager`.
    pub fn builder(
        config: PipelineConfig,
        validator: Arc<Validator>,
        manager: Arc<HandlerManager>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            config,
            validator,
            manager,
            lifecycle: Arc::new(NoOpLifecycleHandler),
            retry_store: Arc::new(InMemoryRetryStore::new()),
            clock: Arc::new(RealClock),
        }
    }

    /// Spawns the workers, the retry scheduler and the cache sweeper.
    ///
    /// # Errors
    ///
    /// Returns `PipelineClosed` if the pipeline was already shut down.
    pub async fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DispatchError::PipelineClosed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("webhook pipeline already started");
            return Ok(());
        }

        info!(
            worker_count = self.config.worker_count,
            queue_capacity = self.config.queue_capacity,
            delivery_mode = ?self.config.delivery_mode,
            "starting webhook pipeline"
        );

        self.retry_manager.start().await;

        let mut pool = WorkerPool::new(
            self.config.worker_count,
            self.receiver.clone(),
            self.processor.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
        );
        pool.spawn_workers().await;
        *self.worker_pool.lock().await = Some(pool);

        if let Some(interval) = self.config.cache_gc_interval {
            let handle = tokio::spawn(sweep_delivery_cache(
                self.validator.delivery_cache().clone(),
                interval,
                self.cancellation_token.clone(),
            ));
            *self.sweeper.lock().await = Some(handle);
        }

        info!("webhook pipeline started");
        Ok(())
    }

    /// Queues a notification for the workers without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` when the queue is at capacity and
    /// `PipelineClosed` after shutdown has begun.
    pub fn enqueue(
        &self,
        notification: InboundNotification,
        source: Option<IpAddr>,
    ) -> std::result::Result<(), HookwiseError> {
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(HookwiseError::PipelineClosed);
        };

        match sender.try_send(QueuedNotification { notification, source }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(item)) => {
                warn!(
                    delivery_id = %item.notification.delivery_id,
                    capacity = self.config.queue_capacity,
                    "inbound queue full"
                );
                Err(HookwiseError::QueueFull { capacity: self.config.queue_capacity })
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Err(HookwiseError::PipelineClosed),
        }
    }

    /// Validates, parses and routes a notification on the caller's task.
    ///
    /// # Errors
    ///
    /// Returns the rejection, or `PipelineClosed` after shutdown has begun.
    pub async fn submit(
        &self,
        notification: InboundNotification,
        source: Option<IpAddr>,
    ) -> std::result::Result<Routed, HookwiseError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HookwiseError::PipelineClosed);
        }
        self.processor.process(QueuedNotification { notification, source }).await
    }

    /// Handler registry.
    pub fn manager(&self) -> &Arc<HandlerManager> {
        &self.manager
    }

    /// Retry manager, for status queries and operator actions.
    pub fn retry_manager(&self) -> &Arc<RetryManager> {
        &self.retry_manager
    }

    /// Admission validator.
    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    /// Pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// True once shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current counters.
    pub async fn stats(&self) -> PipelineStats {
        let mut stats = self.stats.read().await.clone();
        stats.queued = self.queued();
        stats.retry = self.retry_manager.stats().await;
        stats
    }

    /// Notifications waiting in the queue.
    pub fn queued(&self) -> usize {
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.max_capacity() - sender.capacity(),
            None => self.receiver.try_lock().map_or(0, |receiver| receiver.len()),
        }
    }

    /// Stops the pipeline within the configured shutdown timeout.
    ///
    /// New notifications are refused immediately. Queued notifications are
    /// drained by the workers, then the retry manager waits for running
    /// attempts with whatever budget remains. Registrations are dropped last.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if either stage ran out of time; the
    /// remaining work is abandoned and logged.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let timeout = self.config.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        info!(timeout_ms = timeout.as_millis(), "shutting down webhook pipeline");

        self.sender.write().unwrap_or_else(PoisonError::into_inner).take();

        let mut result = Ok(());

        if let Some(pool) = self.worker_pool.lock().await.take() {
            if let Err(e) = pool.shutdown_graceful(remaining(deadline)).await {
                result = Err(e);
            }
        }

        if let Err(e) = self.retry_manager.close(remaining(deadline)).await {
            if result.is_ok() {
                result = Err(e);
            }
        }

        self.cancellation_token.cancel();
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            let _ = sweeper.await;
        }

        let cleared = self.manager.clear().await;
        debug!(handlers = cleared, "handler registrations dropped");

        match &result {
            Ok(()) => info!("webhook pipeline shutdown complete"),
            Err(e) => warn!(error = %e, "webhook pipeline shutdown incomplete"),
        }
        result
    }
}

impl fmt::Debug for WebhookPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookPipeline")
            .field("config", &self.config)
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for WebhookPipeline {
    fn drop(&mut self) {
        if !self.cancellation_token.is_cancelled() {
            if self.started.load(Ordering::Acquire) {
                warn!("webhook pipeline dropped without shutdown, cancelling tasks");
            }
            self.cancellation_token.cancel();
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

async fn sweep_delivery_cache(
    cache: Arc<dyn DeliveryCache>,
    interval: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(interval) => {
                match cache.garbage_collect().await {
                    Ok(0) => {},
                    Ok(removed) => debug!(removed, "delivery cache swept"),
                    Err(e) => warn!(error = %e, "delivery cache sweep failed"),
                }
            },
        }
    }
}
