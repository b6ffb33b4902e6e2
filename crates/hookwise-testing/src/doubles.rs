//! Recording handlers and subscribers with deterministic wait helpers.
//!
//! Every wait is bounded by [`DEFAULT_WAIT_TIMEOUT`] and panics with the
//! observed state on expiry, so a broken pipeline fails the test instead of
//! hanging it.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use hookwise_core::{
    DeliveryId, DomainEvent, EventBus, LifecycleEvent, LifecycleHandler, PublishError,
    WebhookEvent,
};
use hookwise_dispatch::WebhookHandler;
use tokio::sync::Notify;

/// Upper bound for every wait helper.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// How a [`RecordingHandler`] responds to invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Always succeed.
    Succeed,
    /// Fail the first `n` invocations, then succeed.
    FailTimes(usize),
    /// Always fail.
    AlwaysFail,
    /// Panic on every invocation.
    Panic,
}

/// One recorded handler invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Delivery the handler saw.
    pub delivery_id: DeliveryId,
    /// Event type the handler saw.
    pub event_type: String,
    /// When the invocation started.
    pub at: Instant,
    /// Whether the handler reported success.
    pub succeeded: bool,
}

/// Handler that records every invocation and follows a [`Script`].
#[derive(Debug)]
pub struct RecordingHandler {
    script: Script,
    calls: AtomicUsize,
    invocations: Mutex<Vec<Invocation>>,
    notify: Notify,
}

impl RecordingHandler {
    /// Handler following `script`.
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            invocations: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    /// Handler that always succeeds.
    pub fn succeeding() -> Arc<Self> {
        Self::new(Script::Succeed)
    }

    /// Handler that fails the first `n` invocations.
    pub fn failing_times(n: usize) -> Arc<Self> {
        Self::new(Script::FailTimes(n))
    }

    /// Handler that never succeeds.
    pub fn always_failing() -> Arc<Self> {
        Self::new(Script::AlwaysFail)
    }

    /// Number of invocations so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Recorded invocations in call order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().expect("invocations lock").clone()
    }

    /// Gaps between consecutive invocations.
    pub fn intervals(&self) -> Vec<Duration> {
        self.invocations().windows(2).map(|w| w[1].at.duration_since(w[0].at)).collect()
    }

    /// Waits until at least `count` invocations have completed.
    pub async fn wait_for_calls(&self, count: usize) {
        wait_until(&self.notify, DEFAULT_WAIT_TIMEOUT, || self.completed() >= count, || {
            format!("expected {count} handler calls, saw {}", self.completed())
        })
        .await;
    }

    fn completed(&self) -> usize {
        self.invocations.lock().expect("invocations lock").len()
    }
}

#[async_trait]
impl WebhookHandler for RecordingHandler {
    async fn handle(&self, event: &WebhookEvent) -> anyhow::Result<()> {
        let at = Instant::now();
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        let succeeded = match self.script {
            Script::Succeed => true,
            Script::FailTimes(n) => call >= n,
            Script::AlwaysFail => false,
            Script::Panic => {
                self.record(event, at, false);
                panic!("scripted handler panic on call {call}");
            },
        };
        self.record(event, at, succeeded);

        if succeeded {
            Ok(())
        } else {
            anyhow::bail!("scripted failure on call {call}")
        }
    }
}

impl RecordingHandler {
    fn record(&self, event: &WebhookEvent, at: Instant, succeeded: bool) {
        self.invocations.lock().expect("invocations lock").push(Invocation {
            delivery_id: event.delivery_id.clone(),
            event_type: event.event_type.clone(),
            at,
            succeeded,
        });
        self.notify.notify_waiters();
    }
}

/// Event bus that keeps every published event.
#[derive(Debug, Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<DomainEvent>>,
    notify: Notify,
}

impl RecordingEventBus {
    /// Creates an empty bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Published events in order.
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().expect("events lock").clone()
    }

    /// Waits until at least `count` events were published.
    pub async fn wait_for_events(&self, count: usize) {
        wait_until(&self.notify, DEFAULT_WAIT_TIMEOUT, || self.len() >= count, || {
            format!("expected {count} published events, saw {}", self.len())
        })
        .await;
    }

    fn len(&self) -> usize {
        self.events.lock().expect("events lock").len()
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn publish(&self, event: DomainEvent) -> Result<(), PublishError> {
        self.events.lock().expect("events lock").push(event);
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Lifecycle subscriber that keeps every event.
#[derive(Debug, Default)]
pub struct RecordingLifecycle {
    events: Mutex<Vec<LifecycleEvent>>,
    notify: Notify,
}

impl RecordingLifecycle {
    /// Creates an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Received events in order.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().expect("lifecycle lock").clone()
    }

    /// Received events concerning `delivery_id`.
    pub fn events_for(&self, delivery_id: &DeliveryId) -> Vec<LifecycleEvent> {
        self.events().into_iter().filter(|e| e.delivery_id() == delivery_id).collect()
    }

    /// Number of received events satisfying `predicate`.
    pub fn count(&self, predicate: impl Fn(&LifecycleEvent) -> bool) -> usize {
        self.events.lock().expect("lifecycle lock").iter().filter(|e| predicate(e)).count()
    }

    /// Waits until at least `count` events satisfy `predicate`.
    pub async fn wait_for(&self, count: usize, predicate: impl Fn(&LifecycleEvent) -> bool) {
        wait_until(&self.notify, DEFAULT_WAIT_TIMEOUT, || self.count(&predicate) >= count, || {
            format!("expected {count} matching lifecycle events, got {:?}", self.events())
        })
        .await;
    }

    /// Waits for the terminal event of `delivery_id` and returns it.
    pub async fn wait_for_terminal(&self, delivery_id: &DeliveryId) -> LifecycleEvent {
        let is_terminal = |e: &LifecycleEvent| {
            e.delivery_id() == delivery_id
                && matches!(
                    e,
                    LifecycleEvent::Succeeded(_)
                        | LifecycleEvent::Exhausted(_)
                        | LifecycleEvent::Cancelled(_)
                        | LifecycleEvent::Rejected(_)
                )
        };
        self.wait_for(1, is_terminal).await;
        self.events().into_iter().find(|e| is_terminal(e)).expect("terminal event present")
    }
}

#[async_trait]
impl LifecycleHandler for RecordingLifecycle {
    async fn handle_event(&self, event: LifecycleEvent) {
        self.events.lock().expect("lifecycle lock").push(event);
        self.notify.notify_waiters();
    }
}

/// Waits on `notify` until `done` holds, panicking with `describe()` after
/// `timeout`.
async fn wait_until(
    notify: &Notify,
    timeout: Duration,
    done: impl Fn() -> bool,
    describe: impl Fn() -> String,
) {
    let wait = async {
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if done() {
                return;
            }
            notified.await;
        }
    };

    if tokio::time::timeout(timeout, wait).await.is_err() {
        panic!("timed out after {timeout:?}: {}", describe());
    }
}
