//! Handler registry and fan-out dispatch.
//!
//! The [`HandlerManager`] owns the set of registered handlers. Each dispatch
//! takes a snapshot of the registrations, runs every matching handler
//! concurrently under a per-handler timeout and reports which ones failed.
//! A panicking handler is reported as a failure and does not take the
//! dispatching task down with it.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::FutureExt;
use hookwise_core::{DeliveryId, Filter, HandlerId, HookwiseError, WebhookEvent};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, Result};

/// Default budget for a single handler invocation.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Receives webhook events that match its registration filter.
///
/// Handlers must be idempotent: with reliable delivery every matching handler
/// runs again when any handler in the same dispatch fails.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    /// Processes one event.
    async fn handle(&self, event: &WebhookEvent) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`WebhookHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure as a handler.
///
/// ```ignore
/// let handler = handler_fn(|event| async move {
///     println!("{}", event.event_type);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(WebhookEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> WebhookHandler for FnHandler<F>
where
    F: Fn(WebhookEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &WebhookEvent) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

struct Registration {
    filter: Filter,
    handler: Arc<dyn WebhookHandler>,
    registered_at: chrono::DateTime<chrono::Utc>,
}

/// Public view of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationInfo {
    /// Handler identifier.
    pub handler_id: HandlerId,
    /// Events the handler receives.
    pub filter: Filter,
    /// When the handler was registered.
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// Handler that ran.
    pub handler_id: HandlerId,
    /// `Err` carries the failure description.
    pub result: std::result::Result<(), String>,
    /// Wall-clock time the handler took.
    pub elapsed: Duration,
}

/// Result of dispatching one event to every matching handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Dispatched delivery.
    pub delivery_id: DeliveryId,
    /// One entry per matching handler, ordered by handler id.
    pub outcomes: Vec<HandlerOutcome>,
}

impl DispatchReport {
    /// Number of handlers that matched.
    pub fn matched(&self) -> usize {
        self.outcomes.len()
    }

    /// True when no matching handler failed. Zero matches is a success.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Outcomes of the handlers that failed.
    pub fn failures(&self) -> impl Iterator<Item = &HandlerOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    /// One-line description of the failures, for logs and retry records.
    pub fn failure_summary(&self) -> String {
        self.failures()
            .filter_map(|o| o.result.as_ref().err().map(|e| format!("{}: {e}", o.handler_id)))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Converts a failed report into the error the pipeline surfaces.
    pub fn into_error(self) -> Option<HookwiseError> {
        if self.is_success() {
            return None;
        }
        Some(HookwiseError::HandlerFailed {
            delivery_id: self.delivery_id.to_string(),
            matched: self.matched(),
            failed: self.failures().count(),
        })
    }
}

/// Registry of webhook handlers.
pub struct HandlerManager {
    registrations: RwLock<HashMap<HandlerId, Registration>>,
    attempt_timeout: Duration,
}

impl HandlerManager {
    /// Creates an empty registry whose handlers get `attempt_timeout` each.
    pub fn new(attempt_timeout: Duration) -> Self {
        Self { registrations: RwLock::new(HashMap::new()), attempt_timeout }
    }

    /// Per-handler invocation budget.
    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Registers `handler` under `handler_id`.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateHandler` if the identifier is taken.
    pub async fn register(
        &self,
        handler_id: impl Into<HandlerId>,
        filter: Filter,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<()> {
        let handler_id = handler_id.into();
        let mut registrations = self.registrations.write().await;
        if registrations.contains_key(&handler_id) {
            return Err(DispatchError::DuplicateHandler { handler_id });
        }

        info!(handler_id = %handler_id, "handler registered");
        registrations.insert(
            handler_id,
            Registration { filter, handler, registered_at: chrono::Utc::now() },
        );
        Ok(())
    }

    /// Removes a registration. Dispatches already in progress keep their
    /// snapshot and may still invoke the handler once.
    ///
    /// # Errors
    ///
    /// Returns `HandlerNotFound` if nothing is registered under the id.
    pub async fn unregister(&self, handler_id: &HandlerId) -> Result<()> {
        match self.registrations.write().await.remove(handler_id) {
            Some(_) => {
                info!(handler_id = %handler_id, "handler unregistered");
                Ok(())
            },
            None => Err(DispatchError::HandlerNotFound { handler_id: handler_id.clone() }),
        }
    }

    /// Registrations sorted by handler id.
    pub async fn list(&self) -> Vec<RegistrationInfo> {
        let registrations = self.registrations.read().await;
        let mut infos: Vec<_> = registrations
            .iter()
            .map(|(id, r)| RegistrationInfo {
                handler_id: id.clone(),
                filter: r.filter.clone(),
                registered_at: r.registered_at,
            })
            .collect();
        infos.sort_by(|a, b| a.handler_id.cmp(&b.handler_id));
        infos
    }

    /// Number of registered handlers.
    pub async fn len(&self) -> usize {
        self.registrations.read().await.len()
    }

    /// True when no handler is registered.
    pub async fn is_empty(&self) -> bool {
        self.registrations.read().await.is_empty()
    }

    /// Drops every registration, returning how many there were.
    pub async fn clear(&self) -> usize {
        let mut registrations = self.registrations.write().await;
        let count = registrations.len();
        registrations.clear();
        count
    }

    /// Invokes every handler whose filter matches `event`.
    ///
    /// Handlers run concurrently. Each is bounded by the attempt timeout;
    /// a timeout or panic counts as that handler failing.
    pub async fn dispatch(&self, event: &WebhookEvent) -> DispatchReport {
        let mut matching: Vec<(HandlerId, Arc<dyn WebhookHandler>)> = {
            let registrations = self.registrations.read().await;
            registrations
                .iter()
                .filter(|(_, r)| r.filter.matches(event))
                .map(|(id, r)| (id.clone(), r.handler.clone()))
                .collect()
        };
        matching.sort_by(|a, b| a.0.cmp(&b.0));

        debug!(
            delivery_id = %event.delivery_id,
            event_type = %event.event_type,
            matched = matching.len(),
            "dispatching event"
        );

        let invocations = matching
            .into_iter()
            .map(|(handler_id, handler)| self.invoke(handler_id, handler, event));
        let outcomes = futures::future::join_all(invocations).await;

        DispatchReport { delivery_id: event.delivery_id.clone(), outcomes }
    }

    async fn invoke(
        &self,
        handler_id: HandlerId,
        handler: Arc<dyn WebhookHandler>,
        event: &WebhookEvent,
    ) -> HandlerOutcome {
        let started = Instant::now();
        let invocation = AssertUnwindSafe(handler.handle(event)).catch_unwind();

        let result = match tokio::time::timeout(self.attempt_timeout, invocation).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(format!("{e:#}")),
            Ok(Err(panic)) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
            Err(_) => Err(format!("handler timed out after {:?}", self.attempt_timeout)),
        };

        if let Err(error) = &result {
            warn!(
                handler_id = %handler_id,
                delivery_id = %event.delivery_id,
                error = %error,
                "handler failed"
            );
        }

        HandlerOutcome { handler_id, result, elapsed: started.elapsed() }
    }
}

impl Default for HandlerManager {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPT_TIMEOUT)
    }
}

impl fmt::Debug for HandlerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerManager").field("attempt_timeout", &self.attempt_timeout).finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
