//! End-to-end scenarios for the webhook pipeline.
//!
//! Each test drives a fully started pipeline with signed GitHub
//! notifications and observes handlers and lifecycle events.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use hookwise_core::{DeliveryId, Filter, HookwiseError, LifecycleEvent, WebhookEvent};
use hookwise_dispatch::{
    handler_fn, DeliveryMode, DispatchError, PipelineConfig, RetryPolicy, RetryQuery, RetryState,
    Routed,
};
use hookwise_ingest::DeliveryCache;
use hookwise_testing::{
    issues_payload, push_payload, NotificationBuilder, RecordingHandler, TestEnv,
};

fn push(delivery_id: &str) -> NotificationBuilder {
    NotificationBuilder::new()
        .event_type("push")
        .delivery_id(delivery_id)
        .json(&push_payload("octo/hookwise", "main"))
}

#[tokio::test]
async fn push_is_dispatched_once_and_replay_is_rejected() -> Result<()> {
    let env = TestEnv::new().await;
    let handler = RecordingHandler::succeeding();
    env.manager.register("h", Filter::any().event_type("push"), handler.clone()).await?;

    let routed = env.pipeline.submit(push("d1").build(), None).await?;
    assert_eq!(routed, Routed::Scheduled);
    handler.wait_for_calls(1).await;

    let replay = env.pipeline.submit(push("d1").build(), None).await;
    assert!(matches!(replay, Err(HookwiseError::DuplicateDelivery { .. })));

    env.lifecycle.wait_for_terminal(&DeliveryId::from("d1")).await;
    assert_eq!(handler.call_count(), 1);
    assert_eq!(
        env.lifecycle.count(|e| matches!(e, LifecycleEvent::Rejected(r) if r.code == "E1003")),
        1
    );

    env.pipeline.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn forged_signature_never_marks_delivery_seen() -> Result<()> {
    let env = TestEnv::new().await;
    let handler = RecordingHandler::succeeding();
    env.manager.register("h", Filter::any().event_type("push"), handler.clone()).await?;

    let forged = env.pipeline.submit(push("d1").secret("attacker").build(), None).await;
    assert!(matches!(forged, Err(HookwiseError::InvalidSignature { .. })));
    assert_eq!(handler.call_count(), 0);
    assert!(!env.cache.has(&DeliveryId::from("d1")).await?);

    env.pipeline.submit(push("d1").build(), None).await?;
    handler.wait_for_calls(1).await;
    assert!(env.cache.has(&DeliveryId::from("d1")).await?);

    env.pipeline.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn transient_failures_are_retried_with_growing_delays() -> Result<()> {
    let policy = RetryPolicy {
        max_retries: 5,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_secs(1),
        backoff_factor: 2.0,
        jitter: 0.1,
    };
    let env = TestEnv::builder().retry_policy(policy).build().await;
    let handler = RecordingHandler::failing_times(3);
    env.manager.register("h", Filter::any().event_type("push"), handler.clone()).await?;

    env.pipeline.submit(push("d1").build(), None).await?;

    let terminal = env.lifecycle.wait_for_terminal(&DeliveryId::from("d1")).await;
    assert!(matches!(terminal, LifecycleEvent::Succeeded(s) if s.attempts == 4));
    assert_eq!(handler.call_count(), 4);

    let intervals = handler.intervals();
    assert_eq!(intervals.len(), 3);
    assert!(intervals[0] >= Duration::from_millis(45), "first delay {:?}", intervals[0]);
    assert!(intervals.windows(2).all(|w| w[1] > w[0]), "delays must grow: {intervals:?}");

    let stats = env.pipeline.stats().await;
    assert_eq!(stats.retry.retries_scheduled, 3);
    assert_eq!(stats.retry.succeeded, 1);
    assert_eq!(stats.retry.active, 0);

    env.pipeline.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_with_work_remaining_is_bounded_and_final() -> Result<()> {
    let shutdown_timeout = Duration::from_millis(300);
    let config = PipelineConfig {
        worker_count: 2,
        queue_capacity: 16,
        shutdown_timeout,
        delivery_mode: DeliveryMode::Direct,
        retry_policy: RetryPolicy::immediate(0),
        cache_gc_interval: None,
        release_exhausted_deliveries: false,
    };
    let env =
        TestEnv::builder().config(config).attempt_timeout(Duration::from_secs(10)).build().await;

    let started = Arc::new(AtomicUsize::new(0));
    let slow = handler_fn({
        let started = started.clone();
        move |_event: WebhookEvent| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), anyhow::Error>(())
            }
        }
    });
    env.manager.register("slow", Filter::any(), Arc::new(slow)).await?;

    for i in 0..6 {
        env.pipeline.enqueue(push(&format!("d{i}")).build(), None)?;
    }

    let wait_start = Instant::now();
    while started.load(Ordering::SeqCst) < 2 {
        assert!(wait_start.elapsed() < Duration::from_secs(5), "workers never picked up work");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let shutdown_start = Instant::now();
    let result = env.pipeline.shutdown().await;
    let elapsed = shutdown_start.elapsed();

    assert!(matches!(result, Err(DispatchError::ShutdownTimeout { .. })), "{result:?}");
    assert!(elapsed < shutdown_timeout + Duration::from_millis(500), "took {elapsed:?}");

    let late = env.pipeline.enqueue(push("late").build(), None);
    assert!(matches!(late, Err(HookwiseError::PipelineClosed)));
    let late = env.pipeline.submit(push("late").build(), None).await;
    assert!(matches!(late, Err(HookwiseError::PipelineClosed)));
    Ok(())
}

#[tokio::test]
async fn reliable_shutdown_settles_every_accepted_delivery() -> Result<()> {
    let config = PipelineConfig {
        worker_count: 2,
        queue_capacity: 16,
        shutdown_timeout: Duration::from_secs(2),
        delivery_mode: DeliveryMode::Reliable,
        retry_policy: RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: 0.0,
        },
        cache_gc_interval: None,
        release_exhausted_deliveries: false,
    };
    let env = TestEnv::builder().config(config).build().await;

    let finished = Arc::new(AtomicUsize::new(0));
    let slow = handler_fn({
        let finished = finished.clone();
        move |_event: WebhookEvent| {
            let finished = finished.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        }
    });
    let failing = RecordingHandler::always_failing();
    env.manager.register("slow", Filter::any().event_type("push"), Arc::new(slow)).await?;
    env.manager.register("failing", Filter::any().event_type("issues"), failing.clone()).await?;

    let issue = NotificationBuilder::new()
        .event_type("issues")
        .delivery_id("waiting")
        .json(&issues_payload("octo/hookwise", "opened"))
        .build();
    env.pipeline.submit(issue, None).await?;
    env.lifecycle.wait_for(1, |e| matches!(e, LifecycleEvent::RetryScheduled(_))).await;

    env.pipeline.submit(push("running").build(), None).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    env.pipeline.shutdown().await?;

    let running = env.lifecycle.wait_for_terminal(&DeliveryId::from("running")).await;
    assert!(matches!(running, LifecycleEvent::Succeeded(s) if s.attempts == 1));
    assert_eq!(finished.load(Ordering::SeqCst), 1);

    let retry = env.pipeline.retry_manager();
    let waiting = retry.status(&DeliveryId::from("waiting")).await?;
    assert_eq!(waiting.state, RetryState::AwaitingRetry);
    assert_eq!(failing.call_count(), 1);

    let dispatching = RetryQuery { states: vec![RetryState::Dispatching], ..RetryQuery::default() };
    assert!(retry.list(&dispatching).await?.is_empty());
    assert_eq!(env.pipeline.stats().await.retry.active, 1);
    Ok(())
}
