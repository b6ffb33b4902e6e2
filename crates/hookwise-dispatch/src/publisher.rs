//! Handler that republishes webhook events onto an event bus.

use std::sync::Arc;

use async_trait::async_trait;
use hookwise_core::{Clock, DomainEvent, EventBus, Filter, HandlerId, RealClock, WebhookEvent};
use tracing::info;

use crate::{
    error::Result,
    manager::{HandlerManager, WebhookHandler},
};

/// Publishes each matching event as a [`DomainEvent`].
///
/// A bus failure fails the handler, which makes the delivery eligible for
/// retry.
#[derive(Debug)]
pub struct EventBusHandler {
    handler_id: HandlerId,
    context_id: Option<String>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
}

impl EventBusHandler {
    /// Creates a publishing handler tagged with `handler_id`.
    pub fn new(handler_id: impl Into<HandlerId>, bus: Arc<dyn EventBus>) -> Self {
        Self { handler_id: handler_id.into(), context_id: None, bus, clock: Arc::new(RealClock) }
    }

    /// Sets the context identifier carried in published events.
    #[must_use]
    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Sets the clock used to timestamp events.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl WebhookHandler for EventBusHandler {
    async fn handle(&self, event: &WebhookEvent) -> anyhow::Result<()> {
        let domain_event = DomainEvent::from_webhook(
            event,
            self.handler_id.clone(),
            self.context_id.clone(),
            self.clock.now(),
        );
        self.bus.publish(domain_event).await?;
        Ok(())
    }
}

/// Registers an [`EventBusHandler`] named `default-<event_type>` for each
/// event type. Returns how many were registered.
///
/// # Errors
///
/// Fails on the first identifier that is already registered.
pub async fn register_default_handlers<S: AsRef<str>>(
    manager: &HandlerManager,
    bus: Arc<dyn EventBus>,
    event_types: &[S],
) -> Result<usize> {
    for event_type in event_types {
        let event_type = event_type.as_ref();
        let handler_id = HandlerId::new(format!("default-{event_type}"));
        let handler = EventBusHandler::new(handler_id.clone(), bus.clone());

        manager
            .register(handler_id, Filter::any().event_type(event_type), Arc::new(handler))
            .await?;
    }

    info!(count = event_types.len(), "default event bus handlers registered");
    Ok(event_types.len())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use hookwise_core::{DeliveryId, PublishError, TestClock};
    use serde_json::json;

    use super::*;
    use crate::error::DispatchError;

    #[derive(Debug, Default)]
    struct CapturingBus {
        events: Mutex<Vec<DomainEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl EventBus for CapturingBus {
        async fn publish(&self, event: DomainEvent) -> std::result::Result<(), PublishError> {
            if self.fail {
                return Err(PublishError("bus offline".to_string()));
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn push_event() -> WebhookEvent {
        WebhookEvent {
            event_type: "push".to_string(),
            delivery_id: DeliveryId::from("d-42"),
            action: None,
            repository_full_name: Some("octo/hello".to_string()),
            branch: Some("main".to_string()),
            sender_login: Some("octocat".to_string()),
            payload: json!({"ref": "refs/heads/main"}),
            raw_payload: Bytes::from_static(br#"{"ref":"refs/heads/main"}"#),
            received_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn publishes_domain_event_with_context() {
        let bus = Arc::new(CapturingBus::default());
        let clock = TestClock::new();
        let handler = EventBusHandler::new("audit", bus.clone())
            .with_context_id("ctx-1")
            .with_clock(Arc::new(clock.clone()));

        handler.handle(&push_event()).await.unwrap();

        let events = bus.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "github.webhook.push");
        assert_eq!(events[0].timestamp, clock.now());
        assert_eq!(events[0].data.context_id.as_deref(), Some("ctx-1"));
        assert_eq!(events[0].data.handler_id, HandlerId::from("audit"));
    }

    #[tokio::test]
    async fn bus_failure_fails_the_handler() {
        let bus = Arc::new(CapturingBus { fail: true, ..CapturingBus::default() });
        let handler = EventBusHandler::new("audit", bus);

        let err = handler.handle(&push_event()).await.unwrap_err();
        assert!(err.to_string().contains("bus offline"));
    }

    #[tokio::test]
    async fn default_handlers_are_registered_per_event_type() {
        let manager = HandlerManager::default();
        let bus = Arc::new(CapturingBus::default());

        let count =
            register_default_handlers(&manager, bus.clone(), &["push", "issues"]).await.unwrap();
        assert_eq!(count, 2);

        let ids: Vec<_> =
            manager.list().await.into_iter().map(|r| r.handler_id.to_string()).collect();
        assert_eq!(ids, ["default-issues", "default-push"]);

        let report = manager.dispatch(&push_event()).await;
        assert_eq!(report.matched(), 1);
        assert_eq!(bus.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn default_handlers_conflict_with_existing_ids() {
        let manager = HandlerManager::default();
        let bus: Arc<dyn EventBus> = Arc::new(CapturingBus::default());

        register_default_handlers(&manager, bus.clone(), &["push"]).await.unwrap();
        let err = register_default_handlers(&manager, bus, &["push"]).await.unwrap_err();

        assert!(matches!(err, DispatchError::DuplicateHandler { .. }));
    }
}
