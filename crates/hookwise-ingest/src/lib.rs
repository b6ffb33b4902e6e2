//! Admission control for inbound GitHub webhooks.
//!
//! Verifies payload signatures, rejects replays through a delivery cache,
//! checks payload structure against per-event schemas, and optionally
//! restricts source addresses. A notification that passes [`Validator`] is
//! safe to parse and dispatch.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod delivery_cache;
pub mod error;
pub mod schema;
pub mod source_ip;
pub mod validator;

pub use crypto::{generate_hmac_hex, sign_payload, verify_signature, SignatureError, WebhookSecret};
pub use delivery_cache::{CacheError, DeliveryCache, InMemoryDeliveryCache, DEFAULT_RETENTION};
pub use error::{Result, ValidationError};
pub use schema::{PayloadSchema, SchemaError, SchemaRegistry};
pub use source_ip::{IpRange, RangeParseError, SourceAllowlist};
pub use validator::{ValidatedDelivery, Validator, DEFAULT_MAX_PAYLOAD_BYTES};
