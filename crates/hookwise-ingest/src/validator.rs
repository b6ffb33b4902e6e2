//! Admission checks for inbound notifications.
//!
//! Checks run cheapest-first and stop at the first failure:
//!
//! 1. payload size
//! 2. source address allowlist (when configured)
//! 3. required headers
//! 4. HMAC signature (when a secret is configured)
//! 5. replay check against the delivery cache
//! 6. payload schema (when one is registered for the event type)
//!
//! The replay check only runs after the signature verifies. A forged request
//! carrying a real delivery identifier therefore never marks that identifier
//! as seen, and the genuine delivery is still accepted later.

use std::{net::IpAddr, sync::Arc};

use chrono::{DateTime, Utc};
use hookwise_core::{
    models::header_str, Clock, DeliveryId, InboundNotification, RealClock, DELIVERY_ID_HEADER,
    EVENT_TYPE_HEADER, SIGNATURE_HEADER,
};
use http::HeaderMap;
use tracing::{debug, instrument, warn};

use crate::{
    crypto::{verify_signature, SignatureError, WebhookSecret},
    delivery_cache::DeliveryCache,
    error::{Result, ValidationError},
    schema::SchemaRegistry,
    source_ip::SourceAllowlist,
};

/// Default payload size limit, matching GitHub's 25 MB cap.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Outcome of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedDelivery {
    /// Delivery identifier, now recorded as seen.
    pub delivery_id: DeliveryId,
    /// Event type the payload was validated as.
    pub event_type: String,
    /// False when signature verification was skipped.
    pub signature_verified: bool,
    /// Time the identifier was recorded in the cache.
    pub first_seen_at: DateTime<Utc>,
}

/// Validates inbound notifications before they enter the pipeline.
#[derive(Debug)]
pub struct Validator {
    secret: Option<WebhookSecret>,
    verify_signatures: bool,
    cache: Arc<dyn DeliveryCache>,
    schemas: SchemaRegistry,
    allowlist: Option<SourceAllowlist>,
    max_payload_bytes: usize,
    clock: Arc<dyn Clock>,
}

impl Validator {
    /// Creates a validator recording seen deliveries in `cache`.
    ///
    /// Without a secret, signatures are not verified and a warning is logged.
    pub fn new(secret: Option<WebhookSecret>, cache: Arc<dyn DeliveryCache>) -> Self {
        let verify_signatures = secret.is_some();
        if !verify_signatures {
            warn!("no webhook secret configured, signature verification disabled");
        }

        Self {
            secret,
            verify_signatures,
            cache,
            schemas: SchemaRegistry::new(),
            allowlist: None,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            clock: Arc::new(RealClock::new()),
        }
    }

    /// Uses `schemas` for payload validation.
    #[must_use]
    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    /// Only accepts requests whose source address `allowlist` permits.
    ///
    /// An empty allowlist disables the check.
    #[must_use]
    pub fn with_allowlist(mut self, allowlist: SourceAllowlist) -> Self {
        self.allowlist = (!allowlist.is_empty()).then_some(allowlist);
        self
    }

    /// Overrides the payload size limit.
    #[must_use]
    pub fn with_max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = limit;
        self
    }

    /// Uses `clock` for first-seen timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Disables signature verification even when a secret is set.
    ///
    /// For local development only.
    #[must_use]
    pub fn without_signature_verification(mut self) -> Self {
        warn!("signature verification explicitly disabled; do not use in production");
        self.verify_signatures = false;
        self
    }

    /// Returns true if signatures are verified.
    pub fn verifies_signatures(&self) -> bool {
        self.verify_signatures
    }

    /// Returns the delivery cache this validator records into.
    pub fn delivery_cache(&self) -> &Arc<dyn DeliveryCache> {
        &self.cache
    }

    /// Validates a notification received from `source`.
    ///
    /// # Errors
    ///
    /// Returns the first failed check.
    pub async fn validate_notification(
        &self,
        notification: &InboundNotification,
        source: Option<IpAddr>,
    ) -> Result<ValidatedDelivery> {
        self.validate(
            &notification.event_type,
            &notification.raw_payload,
            &notification.headers,
            source,
        )
        .await
    }

    /// Validates a raw payload and its transport headers.
    ///
    /// On success the delivery identifier is recorded as seen.
    ///
    /// # Errors
    ///
    /// Returns the first failed check. Every error is final.
    #[instrument(
        name = "validate_webhook",
        skip(self, payload, headers),
        fields(delivery_id = tracing::field::Empty, payload_size = payload.len())
    )]
    pub async fn validate(
        &self,
        event_type: &str,
        payload: &[u8],
        headers: &HeaderMap,
        source: Option<IpAddr>,
    ) -> Result<ValidatedDelivery> {
        if payload.len() > self.max_payload_bytes {
            return Err(ValidationError::PayloadTooLarge {
                size_bytes: payload.len(),
                limit_bytes: self.max_payload_bytes,
            });
        }

        if let (Some(allowlist), Some(address)) = (&self.allowlist, source) {
            if !allowlist.permits(address) {
                return Err(ValidationError::SourceNotAllowed { address });
            }
        }

        let delivery_id = self.check_headers(headers)?;
        tracing::Span::current().record("delivery_id", delivery_id.as_str());

        let signature_verified = self.check_signature(payload, headers)?;

        let first_seen_at = self.clock.now();
        if !self.cache.insert_if_absent(&delivery_id, first_seen_at).await? {
            return Err(ValidationError::DuplicateDelivery { delivery_id });
        }

        if let Err(violations) = self.schemas.validate(event_type, payload) {
            return Err(ValidationError::SchemaViolation {
                event_type: event_type.to_string(),
                violations,
            });
        }

        debug!(signature_verified, "webhook validated");
        Ok(ValidatedDelivery {
            delivery_id,
            event_type: event_type.to_string(),
            signature_verified,
            first_seen_at,
        })
    }

    /// Returns the delivery identifier if every required header is present.
    ///
    /// The signature header is only required while signatures are verified.
    fn check_headers(&self, headers: &HeaderMap) -> Result<DeliveryId> {
        let mut required = vec![EVENT_TYPE_HEADER, DELIVERY_ID_HEADER];
        if self.verify_signatures {
            required.push(SIGNATURE_HEADER);
        }

        let missing: Vec<String> = required
            .into_iter()
            .filter(|name| header_str(headers, name).is_none())
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(ValidationError::InvalidHeaders { missing });
        }

        header_str(headers, DELIVERY_ID_HEADER)
            .map(DeliveryId::from)
            .ok_or_else(|| ValidationError::InvalidHeaders {
                missing: vec![DELIVERY_ID_HEADER.to_string()],
            })
    }

    fn check_signature(&self, payload: &[u8], headers: &HeaderMap) -> Result<bool> {
        let secret = match (&self.secret, self.verify_signatures) {
            (Some(secret), true) => secret,
            _ => {
                debug!("signature verification skipped");
                return Ok(false);
            },
        };

        let header = header_str(headers, SIGNATURE_HEADER).ok_or(SignatureError::Missing)?;
        verify_signature(payload, header, secret.as_bytes())?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use hookwise_core::TestClock;
    use http::HeaderValue;
    use serde_json::json;

    use super::*;
    use crate::{crypto::sign_payload, delivery_cache::InMemoryDeliveryCache};

    const SECRET: &str = "test-secret";

    fn validator() -> Validator {
        let cache = Arc::new(InMemoryDeliveryCache::new(
            crate::delivery_cache::DEFAULT_RETENTION,
            Arc::new(TestClock::new()),
        ));
        Validator::new(WebhookSecret::new(SECRET), cache)
            .with_schemas(SchemaRegistry::with_defaults())
    }

    fn headers(event: &str, delivery: &str, payload: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(EVENT_TYPE_HEADER, HeaderValue::from_str(event).unwrap());
        headers.insert(DELIVERY_ID_HEADER, HeaderValue::from_str(delivery).unwrap());
        let signature = sign_payload(payload, SECRET.as_bytes()).unwrap();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());
        headers
    }

    fn ping_payload() -> Vec<u8> {
        json!({"zen": "Keep it logically awesome."}).to_string().into_bytes()
    }

    #[tokio::test]
    async fn accepts_signed_delivery_once() {
        let validator = validator();
        let payload = ping_payload();
        let headers = headers("ping", "d1", &payload);

        let accepted = validator.validate("ping", &payload, &headers, None).await.unwrap();
        assert_eq!(accepted.delivery_id.as_str(), "d1");
        assert!(accepted.signature_verified);

        let replay = validator.validate("ping", &payload, &headers, None).await.unwrap_err();
        assert!(matches!(replay, ValidationError::DuplicateDelivery { .. }));
    }

    #[tokio::test]
    async fn reports_all_missing_headers() {
        let validator = validator();
        let err = validator.validate("ping", b"{}", &HeaderMap::new(), None).await.unwrap_err();

        let ValidationError::InvalidHeaders { missing } = err else {
            panic!("expected InvalidHeaders, got {err:?}");
        };
        assert_eq!(missing, vec![EVENT_TYPE_HEADER, DELIVERY_ID_HEADER, SIGNATURE_HEADER]);
    }

    #[tokio::test]
    async fn bad_signature_does_not_mark_delivery_seen() {
        let validator = validator();
        let payload = ping_payload();
        let mut forged = headers("ping", "d1", &payload);
        forged.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_static(
                "sha256=0000000000000000000000000000000000000000000000000000000000000000",
            ),
        );

        let err = validator.validate("ping", &payload, &forged, None).await.unwrap_err();
        assert!(matches!(err, ValidationError::InvalidSignature(SignatureError::Mismatch)));
        assert!(!validator.delivery_cache().has(&DeliveryId::from("d1")).await.unwrap());

        let genuine = headers("ping", "d1", &payload);
        assert!(validator.validate("ping", &payload, &genuine, None).await.is_ok());
    }

    #[tokio::test]
    async fn schema_violations_are_reported() {
        let validator = validator();
        let payload = json!({"ref": "refs/heads/main"}).to_string().into_bytes();
        let headers = headers("push", "d2", &payload);

        let err = validator.validate("push", &payload, &headers, None).await.unwrap_err();
        let ValidationError::SchemaViolation { event_type, violations } = err else {
            panic!("expected SchemaViolation, got {err:?}");
        };
        assert_eq!(event_type, "push");
        assert_eq!(violations.len(), 2);
    }

    #[tokio::test]
    async fn unsigned_mode_skips_signature_header() {
        let cache = Arc::new(InMemoryDeliveryCache::new(
            crate::delivery_cache::DEFAULT_RETENTION,
            Arc::new(TestClock::new()),
        ));
        let validator = Validator::new(None, cache);
        assert!(!validator.verifies_signatures());

        let mut headers = HeaderMap::new();
        headers.insert(EVENT_TYPE_HEADER, HeaderValue::from_static("ping"));
        headers.insert(DELIVERY_ID_HEADER, HeaderValue::from_static("d3"));

        let accepted = validator.validate("ping", b"{}", &headers, None).await.unwrap();
        assert!(!accepted.signature_verified);
    }

    #[tokio::test]
    async fn enforces_size_limit_and_allowlist_first() {
        let validator = validator()
            .with_max_payload_bytes(8)
            .with_allowlist(SourceAllowlist::parse(["10.0.0.0/8"]).unwrap());

        let err =
            validator.validate("ping", &[b'x'; 9], &HeaderMap::new(), None).await.unwrap_err();
        assert!(matches!(err, ValidationError::PayloadTooLarge { size_bytes: 9, limit_bytes: 8 }));

        let outside: IpAddr = "192.168.0.1".parse().unwrap();
        let err = validator.validate("ping", b"{}", &HeaderMap::new(), Some(outside)).await;
        assert!(matches!(err, Err(ValidationError::SourceNotAllowed { .. })));

        let inside: IpAddr = "10.1.1.1".parse().unwrap();
        let err = validator.validate("ping", b"{}", &HeaderMap::new(), Some(inside)).await;
        assert!(matches!(err, Err(ValidationError::InvalidHeaders { .. })));
    }
}
