//! Ingest workers: validate, parse and route queued notifications.

use std::{net::IpAddr, sync::Arc};

use hookwise_core::{
    Clock, DeliveryExhausted, DeliveryId, DeliveryRejected, DeliverySucceeded, HookwiseError,
    InboundNotification, LifecycleEvent, LifecycleHandler, WebhookEvent,
};
use hookwise_ingest::Validator;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::DispatchError,
    manager::{DispatchReport, HandlerManager},
    retry_manager::{RetryManager, RetryStats},
};

/// How accepted events reach their handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Through the retry manager, with backoff on failure.
    #[default]
    Reliable,
    /// One synchronous dispatch; failures are reported and not retried.
    Direct,
}

/// A notification waiting in the inbound queue.
#[derive(Debug, Clone)]
pub struct QueuedNotification {
    /// Transport-level notification.
    pub notification: InboundNotification,
    /// Peer address, when known.
    pub source: Option<IpAddr>,
}

/// Where an accepted event went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Handed to the retry manager.
    Scheduled,
    /// Dispatched directly; the report says how the handlers fared.
    Dispatched(DispatchReport),
}

/// Pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Running ingest workers.
    pub active_workers: usize,
    /// Notifications waiting in the queue.
    pub queued: usize,
    /// Notifications a worker is currently processing.
    pub in_flight: usize,
    /// Notifications that passed validation.
    pub accepted: u64,
    /// Notifications that failed validation or parsing.
    pub rejected: u64,
    /// Direct-mode dispatches performed.
    pub dispatched: u64,
    /// Direct-mode dispatches with at least one failed handler.
    pub dispatch_failures: u64,
    /// Accepted notifications the retry manager refused; their delivery ids
    /// were released for redelivery.
    pub schedule_failures: u64,
    /// Retry manager counters.
    pub retry: RetryStats,
}

/// Shared validate → parse → route logic used by workers and synchronous
/// submission.
pub(crate) struct Processor {
    pub(crate) validator: Arc<Validator>,
    pub(crate) manager: Arc<HandlerManager>,
    pub(crate) retry_manager: Arc<RetryManager>,
    pub(crate) mode: DeliveryMode,
    pub(crate) lifecycle: Arc<dyn LifecycleHandler>,
    pub(crate) stats: Arc<RwLock<PipelineStats>>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Processor {
    #[instrument(
        name = "process_webhook",
        skip_all,
        fields(
            delivery_id = %item.notification.delivery_id,
            event_type = %item.notification.event_type,
        )
    )]
    pub(crate) async fn process(&self, item: QueuedNotification) -> Result<Routed, HookwiseError> {
        let event = match self.admit(&item).await {
            Ok(event) => event,
            Err(err) => {
                self.reject(&item.notification, &err).await;
                return Err(err);
            },
        };

        self.stats.write().await.accepted += 1;
        debug!(mode = ?self.mode, "webhook accepted");

        match self.mode {
            DeliveryMode::Reliable => {
                let (delivery_id, event_type) =
                    (event.delivery_id.clone(), event.event_type.clone());
                match self.retry_manager.schedule(event).await {
                    Ok(()) => Ok(Routed::Scheduled),
                    Err(DispatchError::AlreadyScheduled { delivery_id }) => {
                        warn!(delivery_id = %delivery_id, "delivery already has an active retry");
                        Ok(Routed::Scheduled)
                    },
                    Err(e) => {
                        let err = HookwiseError::from(e);
                        self.unschedulable(delivery_id, event_type, &err).await;
                        Err(err)
                    },
                }
            },
            DeliveryMode::Direct => Ok(Routed::Dispatched(self.dispatch_direct(event).await)),
        }
    }

    async fn admit(&self, item: &QueuedNotification) -> Result<WebhookEvent, HookwiseError> {
        self.validator.validate_notification(&item.notification, item.source).await?;
        WebhookEvent::parse(&item.notification)
    }

    async fn reject(&self, notification: &InboundNotification, err: &HookwiseError) {
        self.stats.write().await.rejected += 1;
        warn!(code = err.code(), error = %err, "webhook rejected");

        self.lifecycle
            .handle_event(LifecycleEvent::Rejected(DeliveryRejected {
                delivery_id: notification.delivery_id.clone(),
                event_type: notification.event_type.clone(),
                code: err.code().to_string(),
                reason: err.to_string(),
                rejected_at: self.clock.now(),
            }))
            .await;
    }

    /// An accepted event the retry manager refused. The delivery id is
    /// released so the provider's redelivery is admitted again.
    async fn unschedulable(
        &self,
        delivery_id: DeliveryId,
        event_type: String,
        err: &HookwiseError,
    ) {
        self.stats.write().await.schedule_failures += 1;
        error!(code = err.code(), error = %err, "accepted webhook could not be scheduled");

        if let Err(e) = self.validator.delivery_cache().remove(&delivery_id).await {
            warn!(error = %e, "failed to release unscheduled delivery");
        }

        self.lifecycle
            .handle_event(LifecycleEvent::Rejected(DeliveryRejected {
                delivery_id,
                event_type,
                code: err.code().to_string(),
                reason: err.to_string(),
                rejected_at: self.clock.now(),
            }))
            .await;
    }

    async fn dispatch_direct(&self, event: WebhookEvent) -> DispatchReport {
        let report = self.manager.dispatch(&event).await;

        {
            let mut stats = self.stats.write().await;
            stats.dispatched += 1;
            if !report.is_success() {
                stats.dispatch_failures += 1;
            }
        }

        let lifecycle_event = if report.is_success() {
            info!(handlers = report.matched(), "delivery dispatched");
            LifecycleEvent::Succeeded(DeliverySucceeded {
                delivery_id: event.delivery_id.clone(),
                event_type: event.event_type.clone(),
                attempts: 1,
                handlers_matched: report.matched(),
                succeeded_at: self.clock.now(),
            })
        } else {
            let error = report.failure_summary();
            warn!(error = %error, "direct dispatch failed, not retried");
            LifecycleEvent::Exhausted(DeliveryExhausted {
                delivery_id: event.delivery_id.clone(),
                event_type: event.event_type.clone(),
                attempts: 1,
                last_error: error,
                exhausted_at: self.clock.now(),
            })
        };
        self.lifecycle.handle_event(lifecycle_event).await;

        report
    }
}

/// Receiving half of the inbound queue, shared by every worker.
pub(crate) type SharedReceiver = Arc<Mutex<mpsc::Receiver<QueuedNotification>>>;

/// One ingest worker.
///
/// Runs until the queue is closed and drained, or until cancellation.
pub(crate) struct IngestWorker {
    id: usize,
    receiver: SharedReceiver,
    processor: Arc<Processor>,
    stats: Arc<RwLock<PipelineStats>>,
    cancellation_token: CancellationToken,
}

impl IngestWorker {
    pub(crate) fn new(
        id: usize,
        receiver: SharedReceiver,
        processor: Arc<Processor>,
        stats: Arc<RwLock<PipelineStats>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, receiver, processor, stats, cancellation_token }
    }

    pub(crate) async fn run(self) {
        loop {
            let item = tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => {
                    info!(worker_id = self.id, "ingest worker received shutdown signal");
                    break;
                },
                item = next_item(&self.receiver) => item,
            };

            let Some(item) = item else {
                debug!(worker_id = self.id, "inbound queue closed and drained");
                break;
            };

            self.stats.write().await.in_flight += 1;

            if let Err(e) = self.processor.process(item).await {
                debug!(
                    worker_id = self.id,
                    code = e.code(),
                    error = %e,
                    "queued webhook not routed"
                );
            }

            let mut stats = self.stats.write().await;
            stats.in_flight = stats.in_flight.saturating_sub(1);
        }
    }
}

async fn next_item(receiver: &SharedReceiver) -> Option<QueuedNotification> {
    receiver.lock().await.recv().await
}
