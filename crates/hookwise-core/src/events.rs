//! Outbound domain events and pipeline lifecycle signals.
//!
//! Two separate channels leave the pipeline:
//!
//! ```text
//!  ┌──────────────────┐  DomainEvent   ┌──────────────┐
//!  │ EventBusHandler  │ ─────────────▶ │   EventBus   │  (agent platform)
//!  │ (registered)     │                └──────────────┘
//!  └──────────────────┘
//!  ┌──────────────────┐ LifecycleEvent ┌──────────────────┐
//!  │ Workers / Retry  │ ─────────────▶ │ LifecycleHandler │  (alerting, audit)
//!  │ Manager          │                └──────────────────┘
//!  └──────────────────┘
//! ```
//!
//! Domain events carry accepted webhook content to consumers. Lifecycle
//! events report what happened to each delivery, including rejections and
//! exhaustion, so nothing is swallowed silently.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::models::{DeliveryId, HandlerId, WebhookEvent};

/// Largest raw payload copied into [`WebhookEventData::payload_excerpt`].
pub const MAX_PAYLOAD_EXCERPT_BYTES: usize = 10_000;

/// Value of [`DomainEvent::source`] and prefix of its type.
pub const EVENT_SOURCE: &str = "github";

/// Normalized event published for consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// `github.webhook.<event_type>`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// Webhook attributes.
    pub data: WebhookEventData,
    /// Originating system.
    pub source: String,
}

/// Payload of a [`DomainEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEventData {
    /// Provider event type.
    pub event_type: String,
    /// Delivery identifier.
    #[serde(rename = "deliveryID")]
    pub delivery_id: DeliveryId,
    /// Event action, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Repository full name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_full_name: Option<String>,
    /// Sender login, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_login: Option<String>,
    /// Conversation context the publishing handler is bound to.
    #[serde(rename = "contextID", default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    /// Handler that published the event.
    #[serde(rename = "handlerID")]
    pub handler_id: HandlerId,
    /// Raw payload, when it is small enough and valid UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_excerpt: Option<String>,
}

impl DomainEvent {
    /// Builds the published form of a webhook event.
    pub fn from_webhook(
        event: &WebhookEvent,
        handler_id: HandlerId,
        context_id: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let payload_excerpt = (event.raw_payload.len() <= MAX_PAYLOAD_EXCERPT_BYTES)
            .then(|| std::str::from_utf8(&event.raw_payload).ok().map(str::to_string))
            .flatten();

        Self {
            event_type: format!("{EVENT_SOURCE}.webhook.{}", event.event_type),
            timestamp,
            data: WebhookEventData {
                event_type: event.event_type.clone(),
                delivery_id: event.delivery_id.clone(),
                action: event.action.clone(),
                repository_full_name: event.repository_full_name.clone(),
                sender_login: event.sender_login.clone(),
                context_id,
                handler_id,
                payload_excerpt,
            },
            source: EVENT_SOURCE.to_string(),
        }
    }
}

/// Event bus publication failure.
#[derive(Debug, Clone, Error)]
#[error("event bus publish failed: {0}")]
pub struct PublishError(pub String);

/// Destination for domain events.
///
/// A publish failure fails the handler that published, which makes the
/// delivery eligible for retry.
#[async_trait::async_trait]
pub trait EventBus: Send + Sync + std::fmt::Debug {
    /// Publishes one event.
    async fn publish(&self, event: DomainEvent) -> Result<(), PublishError>;
}

/// Bus that discards every event.
#[derive(Debug, Default)]
pub struct NoOpEventBus;

#[async_trait::async_trait]
impl EventBus for NoOpEventBus {
    async fn publish(&self, _event: DomainEvent) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Bus that logs each publication.
///
/// Used when no external bus is wired in.
#[derive(Debug, Default)]
pub struct TracingEventBus;

#[async_trait::async_trait]
impl EventBus for TracingEventBus {
    async fn publish(&self, event: DomainEvent) -> Result<(), PublishError> {
        info!(
            event_type = %event.event_type,
            delivery_id = %event.data.delivery_id,
            handler_id = %event.data.handler_id,
            repository = event.data.repository_full_name.as_deref().unwrap_or("-"),
            "domain event published"
        );
        Ok(())
    }
}

/// Bus forwarding each event to several buses concurrently.
///
/// Fails if any inner bus fails, after all of them have been tried.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventBus {
    buses: Vec<Arc<dyn EventBus>>,
}

impl MulticastEventBus {
    /// Creates a multicast bus with no subscribers.
    pub fn new() -> Self {
        Self { buses: Vec::new() }
    }

    /// Adds a downstream bus.
    pub fn add_subscriber(&mut self, bus: Arc<dyn EventBus>) {
        self.buses.push(bus);
    }

    /// Returns the number of downstream buses.
    pub fn subscriber_count(&self) -> usize {
        self.buses.len()
    }
}

#[async_trait::async_trait]
impl EventBus for MulticastEventBus {
    async fn publish(&self, event: DomainEvent) -> Result<(), PublishError> {
        let publishes = self.buses.iter().map(|bus| bus.publish(event.clone()));
        let failures: Vec<String> = futures::future::join_all(publishes)
            .await
            .into_iter()
            .filter_map(|result| result.err().map(|e| e.0))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PublishError(failures.join("; ")))
        }
    }
}

/// What happened to a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// Notification failed validation or parsing.
    Rejected(DeliveryRejected),
    /// All matching handlers succeeded.
    Succeeded(DeliverySucceeded),
    /// An attempt failed and another is scheduled.
    RetryScheduled(RetryScheduled),
    /// Retries were exhausted; terminal.
    Exhausted(DeliveryExhausted),
    /// Pending retries were cancelled by an operator.
    Cancelled(DeliveryCancelled),
}

impl LifecycleEvent {
    /// Returns the delivery the event refers to.
    pub fn delivery_id(&self) -> &DeliveryId {
        match self {
            Self::Rejected(e) => &e.delivery_id,
            Self::Succeeded(e) => &e.delivery_id,
            Self::RetryScheduled(e) => &e.delivery_id,
            Self::Exhausted(e) => &e.delivery_id,
            Self::Cancelled(e) => &e.delivery_id,
        }
    }
}

/// Emitted when a notification is rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRejected {
    /// Delivery identifier; empty when the header was missing.
    pub delivery_id: DeliveryId,
    /// Declared event type.
    pub event_type: String,
    /// Error code of the rejection.
    pub code: String,
    /// Rejection message.
    pub reason: String,
    /// When the rejection happened.
    pub rejected_at: DateTime<Utc>,
}

/// Emitted when a delivery reaches every matching handler successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverySucceeded {
    /// Delivery identifier.
    pub delivery_id: DeliveryId,
    /// Event type.
    pub event_type: String,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Handlers that matched.
    pub handlers_matched: usize,
    /// When the delivery succeeded.
    pub succeeded_at: DateTime<Utc>,
}

/// Emitted when a failed attempt is rescheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryScheduled {
    /// Delivery identifier.
    pub delivery_id: DeliveryId,
    /// Event type.
    pub event_type: String,
    /// Attempt number that will run next.
    pub next_attempt: u32,
    /// Delay before the next attempt.
    pub delay: Duration,
    /// When the next attempt is due.
    pub next_attempt_at: DateTime<Utc>,
    /// Error of the failed attempt.
    pub last_error: String,
}

/// Emitted when a delivery exhausts its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryExhausted {
    /// Delivery identifier.
    pub delivery_id: DeliveryId,
    /// Event type.
    pub event_type: String,
    /// Total attempts made.
    pub attempts: u32,
    /// Error of the final attempt.
    pub last_error: String,
    /// When the delivery was given up on.
    pub exhausted_at: DateTime<Utc>,
}

/// Emitted when pending retries are cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryCancelled {
    /// Delivery identifier.
    pub delivery_id: DeliveryId,
    /// Event type.
    pub event_type: String,
    /// Attempts made before cancellation.
    pub attempts: u32,
    /// When the delivery was cancelled.
    pub cancelled_at: DateTime<Utc>,
}

/// Subscriber to lifecycle events.
///
/// Implementations must not block; the pipeline awaits them inline.
#[async_trait::async_trait]
pub trait LifecycleHandler: Send + Sync + std::fmt::Debug {
    /// Handles one lifecycle event.
    async fn handle_event(&self, event: LifecycleEvent);
}

/// Lifecycle handler that discards every event.
#[derive(Debug, Default)]
pub struct NoOpLifecycleHandler;

#[async_trait::async_trait]
impl LifecycleHandler for NoOpLifecycleHandler {
    async fn handle_event(&self, _event: LifecycleEvent) {}
}

/// Lifecycle handler forwarding to several subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastLifecycleHandler {
    handlers: Vec<Arc<dyn LifecycleHandler>>,
}

impl MulticastLifecycleHandler {
    /// Creates a multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn LifecycleHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl LifecycleHandler for MulticastLifecycleHandler {
    async fn handle_event(&self, event: LifecycleEvent) {
        let deliveries = self.handlers.iter().map(|handler| handler.handle_event(event.clone()));
        futures::future::join_all(deliveries).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use serde_json::json;

    use super::*;

    #[derive(Debug)]
    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl LifecycleHandler for CountingHandler {
        async fn handle_event(&self, _event: LifecycleEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    struct FailingBus;

    #[async_trait::async_trait]
    impl EventBus for FailingBus {
        async fn publish(&self, _event: DomainEvent) -> Result<(), PublishError> {
            Err(PublishError("bus offline".to_string()))
        }
    }

    fn webhook_event(raw: Bytes) -> WebhookEvent {
        WebhookEvent {
            event_type: "issues".to_string(),
            delivery_id: DeliveryId::from("d-42"),
            action: Some("opened".to_string()),
            repository_full_name: Some("octo/hello".to_string()),
            branch: None,
            sender_login: Some("mona".to_string()),
            payload: json!({}),
            raw_payload: raw,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn domain_event_is_namespaced_and_carries_small_payloads() {
        let event = webhook_event(Bytes::from_static(br#"{"action":"opened"}"#));
        let handler_id = HandlerId::from("h1");
        let domain = DomainEvent::from_webhook(&event, handler_id, Some("ctx".into()), Utc::now());

        assert_eq!(domain.event_type, "github.webhook.issues");
        assert_eq!(domain.source, "github");
        assert_eq!(domain.data.payload_excerpt.as_deref(), Some(r#"{"action":"opened"}"#));
        assert_eq!(domain.data.context_id.as_deref(), Some("ctx"));

        let json = serde_json::to_value(&domain).unwrap();
        assert_eq!(json["type"], "github.webhook.issues");
        assert_eq!(json["data"]["deliveryID"], "d-42");
        assert_eq!(json["data"]["handlerID"], "h1");
        assert_eq!(json["data"]["repositoryFullName"], "octo/hello");
    }

    #[test]
    fn domain_event_omits_large_payloads() {
        let raw = Bytes::from(vec![b'a'; MAX_PAYLOAD_EXCERPT_BYTES + 1]);
        let domain =
            DomainEvent::from_webhook(&webhook_event(raw), HandlerId::from("h1"), None, Utc::now());

        assert!(domain.data.payload_excerpt.is_none());
        let json = serde_json::to_value(&domain).unwrap();
        assert!(json["data"].get("payloadExcerpt").is_none());
        assert!(json["data"].get("contextID").is_none());
    }

    #[test]
    fn excerpt_boundary_is_inclusive() {
        let raw = Bytes::from(vec![b'a'; MAX_PAYLOAD_EXCERPT_BYTES]);
        let domain =
            DomainEvent::from_webhook(&webhook_event(raw), HandlerId::from("h1"), None, Utc::now());
        assert_eq!(domain.data.payload_excerpt.map(|p| p.len()), Some(MAX_PAYLOAD_EXCERPT_BYTES));
    }

    #[tokio::test]
    async fn multicast_bus_reports_any_failure() {
        let mut bus = MulticastEventBus::new();
        bus.add_subscriber(Arc::new(NoOpEventBus));
        bus.add_subscriber(Arc::new(FailingBus));
        assert_eq!(bus.subscriber_count(), 2);

        let event = webhook_event(Bytes::from_static(b"{}"));
        let err = bus
            .publish(DomainEvent::from_webhook(&event, HandlerId::from("h"), None, Utc::now()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bus offline"));
    }

    #[tokio::test]
    async fn multicast_lifecycle_reaches_every_subscriber() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut multicast = MulticastLifecycleHandler::new();
        multicast.add_subscriber(Arc::new(CountingHandler { count: count.clone() }));
        multicast.add_subscriber(Arc::new(CountingHandler { count: count.clone() }));

        multicast
            .handle_event(LifecycleEvent::Cancelled(DeliveryCancelled {
                delivery_id: DeliveryId::from("d"),
                event_type: "push".into(),
                attempts: 1,
                cancelled_at: Utc::now(),
            }))
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
