//! Core domain models and event types.
//!
//! Provides the delivery and handler identifiers, the inbound notification
//! and parsed event models, handler filters, outbound domain events, and the
//! coded error taxonomy shared by every hookwise crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use error::{ErrorClass, HookwiseError, Result};
pub use events::{
    DeliveryCancelled, DeliveryExhausted, DeliveryRejected, DeliverySucceeded, DomainEvent,
    EventBus, LifecycleEvent, LifecycleHandler, MulticastEventBus, MulticastLifecycleHandler,
    NoOpEventBus, NoOpLifecycleHandler, PublishError, RetryScheduled, TracingEventBus,
    WebhookEventData, MAX_PAYLOAD_EXCERPT_BYTES,
};
pub use models::{
    DeliveryId, Filter, HandlerId, InboundNotification, WebhookEvent, DELIVERY_ID_HEADER,
    EVENT_TYPE_HEADER, SIGNATURE_HEADER,
};
pub use time::{Clock, RealClock, TestClock};
