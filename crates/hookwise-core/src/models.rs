//! Domain models for inbound webhook notifications.
//!
//! An [`InboundNotification`] is the raw unit the pipeline accepts from the
//! transport. Once validated it is parsed into a [`WebhookEvent`], which is
//! what handler [`Filter`]s match against and what handlers receive.

use std::{collections::BTreeSet, fmt};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HookwiseError, Result};

/// Header carrying the event type, e.g. `push`.
pub const EVENT_TYPE_HEADER: &str = "x-github-event";

/// Header carrying the provider-assigned delivery identifier.
pub const DELIVERY_ID_HEADER: &str = "x-github-delivery";

/// Header carrying the `sha256=<hex>` payload signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Provider-assigned identifier of one logical webhook delivery.
///
/// Stable across provider re-deliveries of the same event, which is what
/// makes it usable as a replay key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(String);

impl DeliveryId {
    /// Wraps a delivery identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the identifier is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeliveryId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeliveryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Unique identifier of a registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(String);

impl HandlerId {
    /// Wraps a handler identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for HandlerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Raw notification as received from the transport.
///
/// Immutable once created. The pipeline owns it until it is dispatched or
/// its retries are exhausted.
#[derive(Debug, Clone)]
pub struct InboundNotification {
    /// Event type as declared by the sender.
    pub event_type: String,
    /// Unmodified request body; signatures are computed over these bytes.
    pub raw_payload: Bytes,
    /// Transport headers, looked up case-insensitively.
    pub headers: HeaderMap,
    /// Provider-assigned delivery identifier.
    pub delivery_id: DeliveryId,
    /// When the transport received the notification.
    pub received_at: DateTime<Utc>,
    /// Transport-level delivery attempt, starting at 1.
    pub delivery_attempt: u32,
}

impl InboundNotification {
    /// Builds a notification from HTTP headers and body.
    ///
    /// Missing event type or delivery headers yield empty values; the
    /// validator rejects those, so construction itself never fails.
    pub fn from_http(headers: HeaderMap, body: Bytes, received_at: DateTime<Utc>) -> Self {
        let event_type = header_str(&headers, EVENT_TYPE_HEADER).unwrap_or_default().to_string();
        let delivery_id =
            DeliveryId::new(header_str(&headers, DELIVERY_ID_HEADER).unwrap_or_default());

        Self {
            event_type,
            raw_payload: body,
            headers,
            delivery_id,
            received_at,
            delivery_attempt: 1,
        }
    }

    /// Returns the payload size in bytes.
    pub fn payload_len(&self) -> usize {
        self.raw_payload.len()
    }
}

/// Returns a header value as trimmed UTF-8, if present and non-empty.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Validated and parsed webhook event.
///
/// Carries the attributes filters match on alongside the decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    /// Event type, e.g. `push` or `pull_request`.
    pub event_type: String,
    /// Provider-assigned delivery identifier.
    pub delivery_id: DeliveryId,
    /// Top-level `action` field, if the event type has one.
    pub action: Option<String>,
    /// `repository.full_name`, e.g. `octo/hello-world`.
    pub repository_full_name: Option<String>,
    /// Branch the event refers to, without the `refs/heads/` prefix.
    pub branch: Option<String>,
    /// `sender.login` of the account that triggered the event.
    pub sender_login: Option<String>,
    /// Decoded JSON payload.
    pub payload: Value,
    /// Raw payload bytes as received.
    pub raw_payload: Bytes,
    /// When the transport received the notification.
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Parses a notification into an event.
    ///
    /// # Errors
    ///
    /// Returns [`HookwiseError::MalformedPayload`] if the body is not a JSON
    /// object.
    pub fn parse(notification: &InboundNotification) -> Result<Self> {
        let payload: Value = serde_json::from_slice(&notification.raw_payload).map_err(|e| {
            HookwiseError::MalformedPayload { message: format!("payload is not valid JSON: {e}") }
        })?;

        if !payload.is_object() {
            return Err(HookwiseError::MalformedPayload {
                message: "payload must be a JSON object".to_string(),
            });
        }

        let action = string_at(&payload, &["action"]);
        let repository_full_name = string_at(&payload, &["repository", "full_name"]);
        let sender_login = string_at(&payload, &["sender", "login"]);
        let branch = branch_of(&notification.event_type, &payload);

        Ok(Self {
            event_type: notification.event_type.clone(),
            delivery_id: notification.delivery_id.clone(),
            action,
            repository_full_name,
            branch,
            sender_login,
            payload,
            raw_payload: notification.raw_payload.clone(),
            received_at: notification.received_at,
        })
    }
}

fn string_at(value: &Value, path: &[&str]) -> Option<String> {
    path.iter()
        .try_fold(value, |current, key| current.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn branch_of(event_type: &str, payload: &Value) -> Option<String> {
    match event_type {
        "push" => string_at(payload, &["ref"])
            .map(|r| r.strip_prefix("refs/heads/").map(str::to_string).unwrap_or(r)),
        "create" | "delete" => match payload.get("ref_type").and_then(Value::as_str) {
            Some("branch") => string_at(payload, &["ref"]),
            _ => None,
        },
        t if t.starts_with("pull_request") => string_at(payload, &["pull_request", "base", "ref"]),
        _ => None,
    }
}

/// Predicate selecting which events a handler receives.
///
/// Each dimension is a set of accepted values; an empty set accepts
/// everything. An event matches when every dimension accepts it. A
/// non-empty dimension never accepts an event that lacks the attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    /// Accepted event types.
    pub event_types: BTreeSet<String>,
    /// Accepted repository full names.
    pub repositories: BTreeSet<String>,
    /// Accepted branches.
    pub branches: BTreeSet<String>,
    /// Accepted actions.
    pub actions: BTreeSet<String>,
}

impl Filter {
    /// Filter that matches every event.
    pub fn any() -> Self {
        Self::default()
    }

    /// Adds an accepted event type.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types.insert(event_type.into());
        self
    }

    /// Adds an accepted repository full name.
    #[must_use]
    pub fn repository(mut self, repository: impl Into<String>) -> Self {
        self.repositories.insert(repository.into());
        self
    }

    /// Adds an accepted branch.
    #[must_use]
    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branches.insert(branch.into());
        self
    }

    /// Adds an accepted action.
    #[must_use]
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.actions.insert(action.into());
        self
    }

    /// Returns true if every dimension accepts the event.
    pub fn matches(&self, event: &WebhookEvent) -> bool {
        accepts(&self.event_types, Some(event.event_type.as_str()))
            && accepts(&self.repositories, event.repository_full_name.as_deref())
            && accepts(&self.branches, event.branch.as_deref())
            && accepts(&self.actions, event.action.as_deref())
    }
}

fn accepts(allowed: &BTreeSet<String>, value: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    value.is_some_and(|v| allowed.contains(v))
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;
    use serde_json::json;

    use super::*;

    fn notification(event_type: &str, payload: &Value) -> InboundNotification {
        InboundNotification {
            event_type: event_type.to_string(),
            raw_payload: Bytes::from(payload.to_string()),
            headers: HeaderMap::new(),
            delivery_id: DeliveryId::from("d-1"),
            received_at: Utc::now(),
            delivery_attempt: 1,
        }
    }

    #[test]
    fn parse_extracts_push_attributes() {
        let payload = json!({
            "ref": "refs/heads/main",
            "repository": {"full_name": "octo/hello"},
            "sender": {"login": "mona"}
        });

        let event = WebhookEvent::parse(&notification("push", &payload)).unwrap();

        assert_eq!(event.branch.as_deref(), Some("main"));
        assert_eq!(event.repository_full_name.as_deref(), Some("octo/hello"));
        assert_eq!(event.sender_login.as_deref(), Some("mona"));
        assert_eq!(event.action, None);
    }

    #[test]
    fn parse_uses_pull_request_base_branch() {
        let payload = json!({
            "action": "opened",
            "pull_request": {"base": {"ref": "release"}, "head": {"ref": "feature"}}
        });

        let event = WebhookEvent::parse(&notification("pull_request", &payload)).unwrap();

        assert_eq!(event.action.as_deref(), Some("opened"));
        assert_eq!(event.branch.as_deref(), Some("release"));
    }

    #[test]
    fn parse_ignores_tag_refs_on_create() {
        let payload = json!({"ref": "v1.0.0", "ref_type": "tag"});
        let event = WebhookEvent::parse(&notification("create", &payload)).unwrap();
        assert_eq!(event.branch, None);
    }

    #[test]
    fn parse_rejects_non_object_payloads() {
        let err = WebhookEvent::parse(&notification("push", &json!([1, 2, 3]))).unwrap_err();
        assert!(matches!(err, HookwiseError::MalformedPayload { .. }));

        let mut raw = notification("push", &json!({}));
        raw.raw_payload = Bytes::from_static(b"not json");
        assert!(WebhookEvent::parse(&raw).is_err());
    }

    #[test]
    fn from_http_reads_identity_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(EVENT_TYPE_HEADER, HeaderValue::from_static("issues"));
        headers.insert(DELIVERY_ID_HEADER, HeaderValue::from_static(" abc-123 "));

        let n = InboundNotification::from_http(headers, Bytes::from_static(b"{}"), Utc::now());

        assert_eq!(n.event_type, "issues");
        assert_eq!(n.delivery_id.as_str(), "abc-123");
        assert_eq!(n.delivery_attempt, 1);
    }

    #[test]
    fn empty_filter_matches_everything() {
        let event =
            WebhookEvent::parse(&notification("deployment", &json!({"action": "created"})))
                .unwrap();
        assert!(Filter::any().matches(&event));
    }

    #[test]
    fn filter_requires_every_dimension() {
        let payload = json!({
            "ref": "refs/heads/main",
            "repository": {"full_name": "octo/hello"}
        });
        let event = WebhookEvent::parse(&notification("push", &payload)).unwrap();

        assert!(Filter::any().event_type("push").event_type("issues").matches(&event));
        assert!(Filter::any().event_type("push").branch("main").matches(&event));
        assert!(!Filter::any().event_type("push").branch("develop").matches(&event));
        assert!(!Filter::any().repository("octo/other").matches(&event));
        // push events carry no action
        assert!(!Filter::any().action("opened").matches(&event));
    }
}
