//! Integration tests for the webhook ingestion endpoint.
//!
//! Drive `POST /webhooks/github` through the router and check status codes,
//! error bodies and what reaches the handlers.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{header::RETRY_AFTER, Request, StatusCode},
    response::Response,
    Router,
};
use hookwise_api::{create_router, AppState, IngestMode, WEBHOOK_ROUTE};
use hookwise_core::{Filter, RealClock};
use hookwise_dispatch::{DeliveryMode, HandlerManager, PipelineConfig, WebhookPipeline};
use hookwise_ingest::{DeliveryCache, InMemoryDeliveryCache, Validator, WebhookSecret};
use hookwise_testing::{push_payload, NotificationBuilder, RecordingHandler, TestEnv, TEST_SECRET};
use serde_json::{json, Value};
use tower::ServiceExt;

fn router_for(env: &TestEnv, ingest_mode: IngestMode) -> Router {
    let state = AppState {
        pipeline: env.pipeline.clone(),
        ingest_mode,
        max_payload_bytes: 1024 * 1024,
        clock: Arc::new(env.clock.clone()),
    };
    create_router(state, Duration::from_secs(5))
}

fn webhook_request(notification: &NotificationBuilder) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri(WEBHOOK_ROUTE)
        .body(Body::from(notification.payload()))
        .expect("valid request");
    *request.headers_mut() = notification.headers();
    request
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    serde_json::from_slice(&bytes).expect("response should be JSON")
}

fn push(delivery_id: &str) -> NotificationBuilder {
    NotificationBuilder::new()
        .event_type("push")
        .delivery_id(delivery_id)
        .json(&push_payload("octo/repo", "main"))
}

#[tokio::test]
async fn valid_webhook_is_accepted_and_dispatched() {
    let env = TestEnv::new().await;
    let handler = RecordingHandler::succeeding();
    let pushes = Filter::any().event_type("push");
    env.manager.register("pushes", pushes, handler.clone()).await.unwrap();
    let app = router_for(&env, IngestMode::Immediate);

    let response = app.oneshot(webhook_request(&push("d-accepted"))).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    assert_eq!(body, json!({"delivery_id": "d-accepted", "status": "scheduled"}));

    handler.wait_for_calls(1).await;
    assert_eq!(handler.invocations()[0].event_type, "push");
    env.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_delivery_is_a_conflict() {
    let env = TestEnv::new().await;
    let app = router_for(&env, IngestMode::Immediate);

    let first = app.clone().oneshot(webhook_request(&push("d-dup"))).await.unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = app.oneshot(webhook_request(&push("d-dup"))).await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(second).await["error"]["code"], "E1003");

    env.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn forged_signature_is_unauthorized() {
    let env = TestEnv::new().await;
    let handler = RecordingHandler::succeeding();
    env.manager.register("all", Filter::any(), handler.clone()).await.unwrap();
    let app = router_for(&env, IngestMode::Immediate);

    let forged = push("d-forged").secret("not-the-secret");
    let response = app.oneshot(webhook_request(&forged)).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "E1002");
    assert!(body["error"]["message"].as_str().unwrap().contains("Invalid signature"));
    assert_eq!(handler.call_count(), 0);

    env.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_headers_are_bad_requests() {
    let env = TestEnv::new().await;
    let app = router_for(&env, IngestMode::Immediate);

    let response =
        app.oneshot(webhook_request(&push("d-headers").without_event_type())).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "E1001");
    assert!(body["error"]["message"].as_str().unwrap().contains("x-github-event"));

    env.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn schema_violations_are_bad_requests() {
    let env = TestEnv::new().await;
    let app = router_for(&env, IngestMode::Immediate);

    let invalid = push("d-schema").json(&json!({"ref": 42}));
    let response = app.oneshot(webhook_request(&invalid)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], "E1004");

    env.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn oversized_payload_is_rejected() {
    let env = TestEnv::new().await;
    let state = AppState {
        pipeline: env.pipeline.clone(),
        ingest_mode: IngestMode::Immediate,
        max_payload_bytes: 64,
        clock: Arc::new(env.clock.clone()),
    };
    let app = create_router(state, Duration::from_secs(5));

    let response = app.oneshot(webhook_request(&push("d-large"))).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json_body(response).await["error"]["code"], "E1006");

    env.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn direct_mode_handler_failure_is_an_internal_error() {
    let env = TestEnv::builder().delivery_mode(DeliveryMode::Direct).build().await;
    let handler = RecordingHandler::always_failing();
    env.manager.register("broken", Filter::any(), handler).await.unwrap();
    let app = router_for(&env, IngestMode::Immediate);

    let response = app.oneshot(webhook_request(&push("d-direct"))).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["error"]["code"], "E2001");

    env.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn queued_mode_applies_backpressure() {
    let cache: Arc<dyn DeliveryCache> =
        Arc::new(InMemoryDeliveryCache::new(Duration::from_secs(60), Arc::new(RealClock)));
    let validator = Validator::new(WebhookSecret::new(TEST_SECRET), cache);
    let config =
        PipelineConfig { queue_capacity: 1, cache_gc_interval: None, ..Default::default() };
    let pipeline = Arc::new(
        WebhookPipeline::builder(config, Arc::new(validator), Arc::new(HandlerManager::default()))
            .build(),
    );
    let state = AppState {
        pipeline: pipeline.clone(),
        ingest_mode: IngestMode::Queued,
        max_payload_bytes: 1024 * 1024,
        clock: Arc::new(RealClock),
    };
    let app = create_router(state, Duration::from_secs(5));

    let first = app.clone().oneshot(webhook_request(&push("d-q1"))).await.unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    assert_eq!(json_body(first).await, json!({"delivery_id": "d-q1", "status": "queued"}));

    let second = app.clone().oneshot(webhook_request(&push("d-q2"))).await.unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(second.headers().contains_key(RETRY_AFTER));
    assert_eq!(json_body(second).await["error"]["code"], "E3001");

    pipeline.shutdown().await.unwrap();

    let closed = app.oneshot(webhook_request(&push("d-q3"))).await.unwrap();
    assert_eq!(closed.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(closed).await["error"]["code"], "E3002");
}
