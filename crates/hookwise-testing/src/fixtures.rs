//! Builders for signed GitHub notifications and realistic payloads.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hookwise_core::{InboundNotification, DELIVERY_ID_HEADER, EVENT_TYPE_HEADER, SIGNATURE_HEADER};
use hookwise_ingest::sign_payload;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};
use uuid::Uuid;

/// Secret used by fixtures unless overridden.
pub const TEST_SECRET: &str = "hookwise-test-secret";

/// Builder for inbound notifications.
///
/// Defaults to a signed `ping` with a random delivery id.
#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    event_type: Option<String>,
    delivery_id: Option<String>,
    payload: Bytes,
    secret: Option<String>,
    signature_override: Option<String>,
    extra_headers: Vec<(String, String)>,
    received_at: DateTime<Utc>,
}

impl NotificationBuilder {
    /// Signed `ping` notification with a fresh delivery id.
    pub fn new() -> Self {
        Self {
            event_type: Some("ping".to_string()),
            delivery_id: Some(Uuid::new_v4().to_string()),
            payload: Bytes::from(json!({"zen": "Keep it logically awesome."}).to_string()),
            secret: Some(TEST_SECRET.to_string()),
            signature_override: None,
            extra_headers: Vec::new(),
            received_at: Utc::now(),
        }
    }

    /// Sets the event type header.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Omits the event type header.
    #[must_use]
    pub fn without_event_type(mut self) -> Self {
        self.event_type = None;
        self
    }

    /// Sets the delivery id header.
    #[must_use]
    pub fn delivery_id(mut self, delivery_id: impl Into<String>) -> Self {
        self.delivery_id = Some(delivery_id.into());
        self
    }

    /// Omits the delivery id header.
    #[must_use]
    pub fn without_delivery_id(mut self) -> Self {
        self.delivery_id = None;
        self
    }

    /// Sets a JSON payload.
    #[must_use]
    pub fn json(mut self, payload: &Value) -> Self {
        self.payload = Bytes::from(payload.to_string());
        self
    }

    /// Sets a raw payload.
    #[must_use]
    pub fn body(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Signs with `secret` instead of [`TEST_SECRET`].
    #[must_use]
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Sends no signature header.
    #[must_use]
    pub fn unsigned(mut self) -> Self {
        self.secret = None;
        self
    }

    /// Sends `signature` verbatim as the signature header.
    #[must_use]
    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature_override = Some(signature.into());
        self
    }

    /// Adds an arbitrary header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Sets the receive timestamp.
    #[must_use]
    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// Request headers as GitHub would send them.
    ///
    /// # Panics
    ///
    /// Panics on header values that are not valid HTTP.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(http::header::USER_AGENT, HeaderValue::from_static("GitHub-Hookshot/test"));

        if let Some(event_type) = &self.event_type {
            headers.insert(EVENT_TYPE_HEADER, header_value(event_type));
        }
        if let Some(delivery_id) = &self.delivery_id {
            headers.insert(DELIVERY_ID_HEADER, header_value(delivery_id));
        }

        let signature = match (&self.signature_override, &self.secret) {
            (Some(signature), _) => Some(signature.clone()),
            (None, Some(secret)) => {
                Some(sign_payload(&self.payload, secret.as_bytes()).expect("HMAC accepts any key"))
            },
            (None, None) => None,
        };
        if let Some(signature) = signature {
            headers.insert(SIGNATURE_HEADER, header_value(&signature));
        }

        for (name, value) in &self.extra_headers {
            let name = HeaderName::from_bytes(name.as_bytes()).expect("valid header name");
            headers.insert(name, header_value(value));
        }
        headers
    }

    /// Payload bytes.
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    /// Builds the notification.
    pub fn build(self) -> InboundNotification {
        let headers = self.headers();
        InboundNotification::from_http(headers, self.payload, self.received_at)
    }
}

impl Default for NotificationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).expect("valid header value")
}

/// Minimal `push` payload satisfying the bundled schema.
pub fn push_payload(repository: &str, branch: &str) -> Value {
    json!({
        "ref": format!("refs/heads/{branch}"),
        "before": "0000000000000000000000000000000000000000",
        "after": "6113728f27ae82c7b1a177c8d03f9e96e0adf246",
        "repository": repository_json(repository),
        "pusher": {"name": "octocat", "email": "octocat@github.com"},
        "sender": sender_json(),
        "commits": [{
            "id": "6113728f27ae82c7b1a177c8d03f9e96e0adf246",
            "message": "Update README",
            "timestamp": "2024-05-01T12:00:00Z",
            "author": {"name": "Octo Cat", "email": "octocat@github.com"}
        }]
    })
}

/// Minimal `pull_request` payload satisfying the bundled schema.
pub fn pull_request_payload(repository: &str, action: &str, base_branch: &str) -> Value {
    json!({
        "action": action,
        "number": 42,
        "pull_request": {
            "id": 1,
            "number": 42,
            "state": "open",
            "title": "Add retry jitter",
            "user": {"login": "octocat", "id": 1},
            "head": {"ref": "feature", "sha": "abc123"},
            "base": {"ref": base_branch, "sha": "def456"}
        },
        "repository": repository_json(repository),
        "sender": sender_json()
    })
}

/// Minimal `issues` payload satisfying the bundled schema.
pub fn issues_payload(repository: &str, action: &str) -> Value {
    json!({
        "action": action,
        "issue": {
            "id": 7,
            "number": 7,
            "title": "Webhook retries are too aggressive",
            "state": "open",
            "user": {"login": "octocat", "id": 1}
        },
        "repository": repository_json(repository),
        "sender": sender_json()
    })
}

fn repository_json(full_name: &str) -> Value {
    let name = full_name.rsplit('/').next().unwrap_or(full_name);
    json!({
        "id": 1_296_269,
        "name": name,
        "full_name": full_name,
        "private": false,
        "owner": {"login": "octocat", "id": 1}
    })
}

fn sender_json() -> Value {
    json!({"login": "octocat", "id": 1})
}
