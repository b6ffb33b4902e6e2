//! Reliable delivery: attempt scheduling, backoff and exhaustion.
//!
//! A single scheduler task owns every active retry record and a deadline
//! heap. Callers talk to it over a command channel; due attempts are spawned
//! onto a [`TaskTracker`] and report back when they finish. Each accepted
//! delivery ends exactly once as succeeded, exhausted or cancelled.
//!
//! Record snapshots are mirrored into a [`RetryStore`] so operators can query
//! them without going through the scheduler.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookwise_core::{
    Clock, DeliveryCancelled, DeliveryExhausted, DeliveryId, DeliverySucceeded, LifecycleEvent,
    LifecycleHandler, NoOpLifecycleHandler, RealClock, RetryScheduled, WebhookEvent,
};
use hookwise_ingest::DeliveryCache;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot, Mutex, RwLock},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    error::{DispatchError, Result},
    manager::HandlerManager,
    retry::{RetryDecision, RetryPolicy},
};

/// Where a delivery is in its retry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryState {
    /// Accepted, first attempt not yet started.
    Pending,
    /// An attempt is running.
    Dispatching,
    /// Waiting for the next attempt's deadline.
    AwaitingRetry,
}

impl fmt::Display for RetryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Dispatching => "dispatching",
            Self::AwaitingRetry => "awaiting_retry",
        };
        f.write_str(name)
    }
}

/// Snapshot of an active retry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    /// Delivery identifier.
    pub delivery_id: DeliveryId,
    /// Event type of the delivery.
    pub event_type: String,
    /// 0-based number of the current or next attempt.
    pub attempt: u32,
    /// Current state.
    pub state: RetryState,
    /// When the next attempt is due, if one is waiting.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Error of the most recent failed attempt.
    pub last_error: Option<String>,
    /// When the delivery was scheduled.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

/// Filter over active retry records. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryQuery {
    /// Restrict to these deliveries.
    pub delivery_ids: Vec<DeliveryId>,
    /// Restrict to these event types.
    pub event_types: Vec<String>,
    /// Restrict to these states.
    pub states: Vec<RetryState>,
    /// Minimum attempt number, inclusive.
    pub min_attempt: Option<u32>,
    /// Maximum attempt number, inclusive.
    pub max_attempt: Option<u32>,
    /// Scheduled at or after this instant.
    pub created_after: Option<DateTime<Utc>>,
    /// Scheduled at or before this instant.
    pub created_before: Option<DateTime<Utc>>,
}

impl RetryQuery {
    /// Returns true if `record` satisfies every populated criterion.
    pub fn matches(&self, record: &RetryRecord) -> bool {
        (self.delivery_ids.is_empty() || self.delivery_ids.contains(&record.delivery_id))
            && (self.event_types.is_empty() || self.event_types.contains(&record.event_type))
            && (self.states.is_empty() || self.states.contains(&record.state))
            && self.min_attempt.map_or(true, |min| record.attempt >= min)
            && self.max_attempt.map_or(true, |max| record.attempt <= max)
            && self.created_after.map_or(true, |after| record.created_at >= after)
            && self.created_before.map_or(true, |before| record.created_at <= before)
    }
}

/// Storage for retry record snapshots.
///
/// The scheduler is the only writer. Records are removed once the delivery
/// reaches a terminal state.
#[async_trait]
pub trait RetryStore: Send + Sync + fmt::Debug {
    /// Inserts or replaces a record.
    async fn upsert(&self, record: RetryRecord) -> Result<()>;

    /// Returns the record for `delivery_id`.
    async fn get(&self, delivery_id: &DeliveryId) -> Result<Option<RetryRecord>>;

    /// Removes and returns the record for `delivery_id`.
    async fn remove(&self, delivery_id: &DeliveryId) -> Result<Option<RetryRecord>>;

    /// Records matching `query`, oldest first.
    async fn list(&self, query: &RetryQuery) -> Result<Vec<RetryRecord>>;
}

/// Process-local [`RetryStore`]. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryRetryStore {
    records: RwLock<HashMap<DeliveryId, RetryRecord>>,
}

impl InMemoryRetryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RetryStore for InMemoryRetryStore {
    async fn upsert(&self, record: RetryRecord) -> Result<()> {
        self.records.write().await.insert(record.delivery_id.clone(), record);
        Ok(())
    }

    async fn get(&self, delivery_id: &DeliveryId) -> Result<Option<RetryRecord>> {
        Ok(self.records.read().await.get(delivery_id).cloned())
    }

    async fn remove(&self, delivery_id: &DeliveryId) -> Result<Option<RetryRecord>> {
        Ok(self.records.write().await.remove(delivery_id))
    }

    async fn list(&self, query: &RetryQuery) -> Result<Vec<RetryRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<_> = records.values().filter(|r| query.matches(r)).cloned().collect();
        matching.sort_by(|a, b| {
            a.created_at.cmp(&b.created_at).then_with(|| a.delivery_id.cmp(&b.delivery_id))
        });
        Ok(matching)
    }
}

/// Counters maintained by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Deliveries accepted for reliable dispatch.
    pub scheduled: u64,
    /// Attempts started.
    pub attempts: u64,
    /// Deliveries whose handlers all succeeded.
    pub succeeded: u64,
    /// Failed attempts that were rescheduled.
    pub retries_scheduled: u64,
    /// Deliveries that ran out of attempts.
    pub exhausted: u64,
    /// Deliveries cancelled by an operator.
    pub cancelled: u64,
    /// Records not yet terminal.
    pub active: usize,
}

/// Construction options for a [`RetryManager`].
pub struct RetryOptions {
    policy: RetryPolicy,
    manager: Arc<HandlerManager>,
    lifecycle: Arc<dyn LifecycleHandler>,
    store: Arc<dyn RetryStore>,
    clock: Arc<dyn Clock>,
    release_on_exhaustion: Option<Arc<dyn DeliveryCache>>,
}

impl RetryOptions {
    /// Options dispatching through `manager` with `policy`.
    pub fn new(policy: RetryPolicy, manager: Arc<HandlerManager>) -> Self {
        Self {
            policy,
            manager,
            lifecycle: Arc::new(NoOpLifecycleHandler),
            store: Arc::new(InMemoryRetryStore::new()),
            clock: Arc::new(RealClock),
            release_on_exhaustion: None,
        }
    }

    /// Receives succeeded, rescheduled, exhausted and cancelled events.
    #[must_use]
    pub fn with_lifecycle_handler(mut self, lifecycle: Arc<dyn LifecycleHandler>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Replaces the in-memory record store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RetryStore>) -> Self {
        self.store = store;
        self
    }

    /// Clock for record and lifecycle timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Removes exhausted deliveries from `cache` so a provider redelivery is
    /// admitted again.
    #[must_use]
    pub fn releasing_exhausted_from(mut self, cache: Arc<dyn DeliveryCache>) -> Self {
        self.release_on_exhaustion = Some(cache);
        self
    }
}

enum Command {
    Schedule { event: Arc<WebhookEvent>, reply: oneshot::Sender<Result<()>> },
    AttemptFinished { delivery_id: DeliveryId, attempt: u32, outcome: AttemptOutcome },
    RetryNow { delivery_id: DeliveryId, reply: oneshot::Sender<Result<()>> },
    Cancel { delivery_id: DeliveryId, reply: oneshot::Sender<Result<()>> },
    Close { deadline: Instant },
}

enum AttemptOutcome {
    Succeeded { matched: usize },
    Failed { error: String },
}

/// Time the scheduler gets past the close deadline to log and exit.
const SCHEDULER_EXIT_GRACE: Duration = Duration::from_millis(100);

/// Schedules dispatch attempts with exponential backoff.
pub struct RetryManager {
    commands: mpsc::UnboundedSender<Command>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    scheduler: Mutex<Option<Scheduler>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    store: Arc<dyn RetryStore>,
    stats: Arc<RwLock<RetryStats>>,
    cancellation_token: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl RetryManager {
    /// Creates a manager. Nothing runs until [`RetryManager::start`].
    pub fn new(options: RetryOptions) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(RwLock::new(RetryStats::default()));
        let tracker = TaskTracker::new();

        let scheduler = Scheduler {
            policy: options.policy,
            manager: options.manager,
            lifecycle: options.lifecycle,
            store: options.store.clone(),
            clock: options.clock,
            release_on_exhaustion: options.release_on_exhaustion,
            entries: HashMap::new(),
            deadlines: BinaryHeap::new(),
            sequence: 0,
            commands: commands.clone(),
            tracker: tracker.clone(),
            stats: stats.clone(),
        };

        Self {
            commands,
            receiver: Mutex::new(Some(receiver)),
            scheduler: Mutex::new(Some(scheduler)),
            handle: Mutex::new(None),
            store: options.store,
            stats,
            cancellation_token: CancellationToken::new(),
            tracker,
            closed: AtomicBool::new(false),
        }
    }

    /// Spawns the scheduler task. Calling it again is a no-op.
    pub async fn start(&self) {
        let (Some(scheduler), Some(receiver)) =
            (self.scheduler.lock().await.take(), self.receiver.lock().await.take())
        else {
            return;
        };

        let token = self.cancellation_token.clone();
        let handle = tokio::spawn(scheduler.run(receiver, token));
        *self.handle.lock().await = Some(handle);
        debug!("retry scheduler started");
    }

    /// Accepts `event` for reliable dispatch. Attempt 0 runs immediately.
    ///
    /// # Errors
    ///
    /// Returns `PipelineClosed` after [`RetryManager::close`] and
    /// `AlreadyScheduled` if the delivery already has an active record.
    pub async fn schedule(&self, event: WebhookEvent) -> Result<()> {
        self.request(|reply| Command::Schedule { event: Arc::new(event), reply }).await
    }

    /// Moves a waiting delivery's next attempt to now.
    ///
    /// # Errors
    ///
    /// Returns `RetryNotFound` for unknown deliveries and
    /// `InvalidRetryState` while an attempt is running.
    pub async fn retry_now(&self, delivery_id: &DeliveryId) -> Result<()> {
        let delivery_id = delivery_id.clone();
        self.request(|reply| Command::RetryNow { delivery_id, reply }).await
    }

    /// Abandons a delivery's remaining attempts. A running attempt finishes
    /// but is not followed by another.
    ///
    /// # Errors
    ///
    /// Returns `RetryNotFound` for unknown deliveries.
    pub async fn cancel(&self, delivery_id: &DeliveryId) -> Result<()> {
        let delivery_id = delivery_id.clone();
        self.request(|reply| Command::Cancel { delivery_id, reply }).await
    }

    /// Current record of an active delivery.
    ///
    /// # Errors
    ///
    /// Returns `RetryNotFound` if the delivery has no active record.
    pub async fn status(&self, delivery_id: &DeliveryId) -> Result<RetryRecord> {
        self.store
            .get(delivery_id)
            .await?
            .ok_or_else(|| DispatchError::RetryNotFound { delivery_id: delivery_id.clone() })
    }

    /// Active records matching `query`, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list(&self, query: &RetryQuery) -> Result<Vec<RetryRecord>> {
        self.store.list(query).await
    }

    /// Scheduler counters.
    pub async fn stats(&self) -> RetryStats {
        self.stats.read().await.clone()
    }

    /// True once [`RetryManager::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops accepting work and waits up to `timeout` for running attempts.
    ///
    /// Accepted deliveries whose first attempt has not started yet still get
    /// it. Outcomes of attempts that finish before the deadline are recorded
    /// as usual. No further retries start; records left waiting for one, or
    /// still running at the deadline, are logged as abandoned and stay in the
    /// store.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if attempts are still running at the
    /// deadline.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!(timeout_ms = timeout.as_millis(), "closing retry manager");
        let deadline = Instant::now() + timeout;
        if self.commands.send(Command::Close { deadline }).is_err() {
            debug!("retry scheduler already stopped");
        }

        if let Some(handle) = self.handle.lock().await.take() {
            match tokio::time::timeout_at(deadline + SCHEDULER_EXIT_GRACE, handle).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => error!(error = %e, "retry scheduler task failed"),
                Err(_) => {
                    warn!("retry scheduler did not stop before the deadline");
                    self.cancellation_token.cancel();
                },
            }
        }

        self.tracker.close();
        if tokio::time::timeout_at(deadline, self.tracker.wait()).await.is_err() {
            warn!(in_flight = self.tracker.len(), "dispatch attempts still running at deadline");
            return Err(DispatchError::ShutdownTimeout { timeout });
        }

        info!("retry manager closed");
        Ok(())
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(DispatchError::PipelineClosed);
        }

        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).map_err(|_| DispatchError::PipelineClosed)?;
        response.await.map_err(|_| DispatchError::PipelineClosed)?
    }
}

impl fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryManager")
            .field("closed", &self.is_closed())
            .field("in_flight", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

impl Drop for RetryManager {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("retry manager dropped without close, cancelling scheduler");
        }
        self.cancellation_token.cancel();
    }
}

struct Entry {
    event: Arc<WebhookEvent>,
    attempt: u32,
    state: RetryState,
    due: Option<(Instant, u64)>,
    next_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    cancel_requested: bool,
    created_at: DateTime<Utc>,
}

struct Scheduler {
    policy: RetryPolicy,
    manager: Arc<HandlerManager>,
    lifecycle: Arc<dyn LifecycleHandler>,
    store: Arc<dyn RetryStore>,
    clock: Arc<dyn Clock>,
    release_on_exhaustion: Option<Arc<dyn DeliveryCache>>,
    entries: HashMap<DeliveryId, Entry>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, DeliveryId)>>,
    sequence: u64,
    commands: mpsc::UnboundedSender<Command>,
    tracker: TaskTracker,
    stats: Arc<RwLock<RetryStats>>,
}

impl Scheduler {
    async fn run(
        mut self,
        mut receiver: mpsc::UnboundedReceiver<Command>,
        token: CancellationToken,
    ) {
        loop {
            let next_deadline = self.deadlines.peek().map(|Reverse((at, _, _))| *at);

            tokio::select! {
                biased;

                () = token.cancelled() => {
                    debug!(active = self.entries.len(), "retry scheduler cancelled");
                    return;
                },

                command = receiver.recv() => match command {
                    Some(Command::Close { deadline }) => {
                        self.drain_on_close(&mut receiver, &token, deadline).await;
                        return;
                    },
                    Some(command) => self.handle(command).await,
                    None => return,
                },

                () = sleep_until(next_deadline) => self.start_due_attempts().await,
            }
        }
    }

    /// Runs until every running attempt has reported back or `deadline`
    /// passes. Only first attempts may start from here on.
    async fn drain_on_close(
        &mut self,
        receiver: &mut mpsc::UnboundedReceiver<Command>,
        token: &CancellationToken,
        deadline: Instant,
    ) {
        self.start_first_attempts().await;

        while self.in_flight() > 0 {
            tokio::select! {
                biased;

                () = token.cancelled() => break,

                command = receiver.recv() => match command {
                    Some(Command::AttemptFinished { delivery_id, attempt, outcome }) => {
                        self.finish_attempt(delivery_id, attempt, outcome).await;
                    },
                    Some(command) => reject_closed(command),
                    None => break,
                },

                () = tokio::time::sleep_until(deadline) => break,
            }
        }

        while let Ok(command) = receiver.try_recv() {
            match command {
                Command::AttemptFinished { delivery_id, attempt, outcome } => {
                    self.finish_attempt(delivery_id, attempt, outcome).await;
                },
                command => reject_closed(command),
            }
        }

        self.log_abandoned();
    }

    fn in_flight(&self) -> usize {
        self.entries.values().filter(|e| e.state == RetryState::Dispatching).count()
    }

    fn log_abandoned(&self) {
        let mut running = Vec::new();
        let mut waiting = Vec::new();
        for entry in self.entries.values() {
            let id = entry.event.delivery_id.as_str();
            match entry.state {
                RetryState::Dispatching => running.push(id),
                RetryState::Pending | RetryState::AwaitingRetry => waiting.push(id),
            }
        }

        if !running.is_empty() {
            warn!(
                abandoned = running.len(),
                deliveries = %running.join(","),
                "retry manager closed with dispatch attempts still running"
            );
        }
        if !waiting.is_empty() {
            warn!(
                abandoned = waiting.len(),
                deliveries = %waiting.join(","),
                "retry manager closed with deliveries awaiting retry"
            );
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Schedule { event, reply } => {
                let _ = reply.send(self.schedule(event).await);
            },
            Command::AttemptFinished { delivery_id, attempt, outcome } => {
                self.finish_attempt(delivery_id, attempt, outcome).await;
            },
            Command::RetryNow { delivery_id, reply } => {
                let _ = reply.send(self.retry_now(&delivery_id).await);
            },
            Command::Cancel { delivery_id, reply } => {
                let _ = reply.send(self.cancel(&delivery_id).await);
            },
            Command::Close { .. } => {},
        }
    }

    async fn schedule(&mut self, event: Arc<WebhookEvent>) -> Result<()> {
        let delivery_id = event.delivery_id.clone();
        if self.entries.contains_key(&delivery_id) {
            return Err(DispatchError::AlreadyScheduled { delivery_id });
        }

        let now = self.clock.now();
        let entry = Entry {
            event,
            attempt: 0,
            state: RetryState::Pending,
            due: None,
            next_attempt_at: Some(now),
            last_error: None,
            cancel_requested: false,
            created_at: now,
        };
        self.entries.insert(delivery_id.clone(), entry);
        self.set_due(&delivery_id, Instant::now());
        self.persist(&delivery_id).await;

        let mut stats = self.stats.write().await;
        stats.scheduled += 1;
        stats.active = self.entries.len();
        Ok(())
    }

    async fn retry_now(&mut self, delivery_id: &DeliveryId) -> Result<()> {
        let Some(entry) = self.entries.get(delivery_id) else {
            return Err(DispatchError::RetryNotFound { delivery_id: delivery_id.clone() });
        };
        match entry.state {
            RetryState::Pending => Ok(()),
            RetryState::Dispatching => Err(DispatchError::InvalidRetryState {
                delivery_id: delivery_id.clone(),
                state: entry.state.to_string(),
                operation: "retry now",
            }),
            RetryState::AwaitingRetry => {
                info!(delivery_id = %delivery_id, attempt = entry.attempt, "retry forced");
                self.set_due(delivery_id, Instant::now());
                if let Some(entry) = self.entries.get_mut(delivery_id) {
                    entry.next_attempt_at = Some(self.clock.now());
                }
                self.persist(delivery_id).await;
                Ok(())
            },
        }
    }

    async fn cancel(&mut self, delivery_id: &DeliveryId) -> Result<()> {
        let Some(entry) = self.entries.get_mut(delivery_id) else {
            return Err(DispatchError::RetryNotFound { delivery_id: delivery_id.clone() });
        };

        if entry.state == RetryState::Dispatching {
            entry.cancel_requested = true;
            info!(delivery_id = %delivery_id, "cancellation requested for running attempt");
            return Ok(());
        }

        if let Some(entry) = self.entries.remove(delivery_id) {
            let attempts = entry_attempts_made(&entry);
            self.finish_cancelled(entry, attempts).await;
        }
        Ok(())
    }

    async fn start_due_attempts(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((at, sequence, _))) = self.deadlines.peek() {
            if *at > now {
                break;
            }
            let (at, sequence) = (*at, *sequence);
            let Some(Reverse((_, _, delivery_id))) = self.deadlines.pop() else {
                break;
            };

            let is_current =
                self.entries.get(&delivery_id).is_some_and(|e| e.due == Some((at, sequence)));
            if is_current {
                self.start_attempt(&delivery_id).await;
            }
        }
    }

    async fn start_first_attempts(&mut self) {
        let pending = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == RetryState::Pending)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for delivery_id in pending {
            self.start_attempt(&delivery_id).await;
        }
    }

    async fn start_attempt(&mut self, delivery_id: &DeliveryId) {
        let Some(entry) = self.entries.get_mut(delivery_id) else {
            return;
        };
        entry.due = None;
        entry.next_attempt_at = None;
        entry.state = RetryState::Dispatching;
        let event = entry.event.clone();
        let attempt = entry.attempt;
        self.persist(delivery_id).await;
        self.stats.write().await.attempts += 1;

        debug!(delivery_id = %delivery_id, attempt, "dispatch attempt starting");
        let manager = self.manager.clone();
        let commands = self.commands.clone();
        self.tracker.spawn(async move {
            let report = manager.dispatch(&event).await;
            let outcome = if report.is_success() {
                AttemptOutcome::Succeeded { matched: report.matched() }
            } else {
                AttemptOutcome::Failed { error: report.failure_summary() }
            };
            if commands
                .send(Command::AttemptFinished {
                    delivery_id: event.delivery_id.clone(),
                    attempt,
                    outcome,
                })
                .is_err()
            {
                warn!(
                    delivery_id = %event.delivery_id,
                    attempt,
                    "attempt finished after the retry scheduler stopped"
                );
            }
        });
    }

    async fn finish_attempt(
        &mut self,
        delivery_id: DeliveryId,
        attempt: u32,
        outcome: AttemptOutcome,
    ) {
        let Some(entry) = self.entries.get(&delivery_id) else {
            debug!(delivery_id = %delivery_id, "attempt finished for unknown delivery");
            return;
        };
        if entry.state != RetryState::Dispatching || entry.attempt != attempt {
            debug!(delivery_id = %delivery_id, attempt, "stale attempt result ignored");
            return;
        }
        let cancel_requested = entry.cancel_requested;

        match outcome {
            AttemptOutcome::Succeeded { matched } => {
                if let Some(entry) = self.entries.remove(&delivery_id) {
                    self.finish_succeeded(entry, attempt + 1, matched).await;
                }
            },
            AttemptOutcome::Failed { error } if cancel_requested => {
                if let Some(mut entry) = self.entries.remove(&delivery_id) {
                    entry.last_error = Some(error);
                    self.finish_cancelled(entry, attempt + 1).await;
                }
            },
            AttemptOutcome::Failed { error } => match self.policy.decide(attempt) {
                RetryDecision::Retry { attempt: next, delay } => {
                    self.reschedule(&delivery_id, next, delay, error).await;
                },
                RetryDecision::Exhausted { attempts } => {
                    if let Some(entry) = self.entries.remove(&delivery_id) {
                        self.finish_exhausted(entry, attempts, error).await;
                    }
                },
            },
        }

        self.stats.write().await.active = self.entries.len();
    }

    async fn reschedule(
        &mut self,
        delivery_id: &DeliveryId,
        next: u32,
        delay: Duration,
        error: String,
    ) {
        let now = self.clock.now();
        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(now);
        let Some(entry) = self.entries.get_mut(delivery_id) else {
            return;
        };
        entry.attempt = next;
        entry.state = RetryState::AwaitingRetry;
        entry.next_attempt_at = Some(next_attempt_at);
        entry.last_error = Some(error.clone());
        let event_type = entry.event.event_type.clone();

        self.set_due(delivery_id, Instant::now() + delay);
        self.persist(delivery_id).await;
        self.stats.write().await.retries_scheduled += 1;

        warn!(
            delivery_id = %delivery_id,
            next_attempt = next,
            delay_ms = delay.as_millis(),
            error = %error,
            "dispatch attempt failed, retry scheduled"
        );
        self.lifecycle
            .handle_event(LifecycleEvent::RetryScheduled(RetryScheduled {
                delivery_id: delivery_id.clone(),
                event_type,
                next_attempt: next,
                delay,
                next_attempt_at,
                last_error: error,
            }))
            .await;
    }

    async fn finish_succeeded(&mut self, entry: Entry, attempts: u32, matched: usize) {
        let delivery_id = entry.event.delivery_id.clone();
        self.forget(&delivery_id).await;
        self.stats.write().await.succeeded += 1;

        info!(delivery_id = %delivery_id, attempts, handlers = matched, "delivery dispatched");
        self.lifecycle
            .handle_event(LifecycleEvent::Succeeded(DeliverySucceeded {
                delivery_id,
                event_type: entry.event.event_type.clone(),
                attempts,
                handlers_matched: matched,
                succeeded_at: self.clock.now(),
            }))
            .await;
    }

    async fn finish_exhausted(&mut self, entry: Entry, attempts: u32, error: String) {
        let delivery_id = entry.event.delivery_id.clone();
        self.forget(&delivery_id).await;
        self.stats.write().await.exhausted += 1;

        error!(
            delivery_id = %delivery_id,
            event_type = %entry.event.event_type,
            attempts,
            error = %error,
            "delivery exhausted its retries"
        );

        if let Some(cache) = &self.release_on_exhaustion {
            if let Err(e) = cache.remove(&delivery_id).await {
                warn!(
                    delivery_id = %delivery_id,
                    error = %e,
                    "failed to release exhausted delivery"
                );
            }
        }

        self.lifecycle
            .handle_event(LifecycleEvent::Exhausted(DeliveryExhausted {
                delivery_id,
                event_type: entry.event.event_type.clone(),
                attempts,
                last_error: error,
                exhausted_at: self.clock.now(),
            }))
            .await;
    }

    async fn finish_cancelled(&mut self, entry: Entry, attempts: u32) {
        let delivery_id = entry.event.delivery_id.clone();
        self.forget(&delivery_id).await;
        {
            let mut stats = self.stats.write().await;
            stats.cancelled += 1;
            stats.active = self.entries.len();
        }

        info!(delivery_id = %delivery_id, attempts, "delivery cancelled");
        self.lifecycle
            .handle_event(LifecycleEvent::Cancelled(DeliveryCancelled {
                delivery_id,
                event_type: entry.event.event_type.clone(),
                attempts,
                cancelled_at: self.clock.now(),
            }))
            .await;
    }

    fn set_due(&mut self, delivery_id: &DeliveryId, at: Instant) {
        self.sequence += 1;
        let sequence = self.sequence;
        if let Some(entry) = self.entries.get_mut(delivery_id) {
            entry.due = Some((at, sequence));
            self.deadlines.push(Reverse((at, sequence, delivery_id.clone())));
        }
    }

    async fn persist(&self, delivery_id: &DeliveryId) {
        let Some(entry) = self.entries.get(delivery_id) else {
            return;
        };
        let record = RetryRecord {
            delivery_id: delivery_id.clone(),
            event_type: entry.event.event_type.clone(),
            attempt: entry.attempt,
            state: entry.state,
            next_attempt_at: entry.next_attempt_at,
            last_error: entry.last_error.clone(),
            created_at: entry.created_at,
            updated_at: self.clock.now(),
        };
        if let Err(e) = self.store.upsert(record).await {
            warn!(delivery_id = %delivery_id, error = %e, "failed to persist retry record");
        }
    }

    async fn forget(&self, delivery_id: &DeliveryId) {
        if let Err(e) = self.store.remove(delivery_id).await {
            warn!(delivery_id = %delivery_id, error = %e, "failed to remove retry record");
        }
    }
}

fn reject_closed(command: Command) {
    match command {
        Command::Schedule { reply, .. }
        | Command::RetryNow { reply, .. }
        | Command::Cancel { reply, .. } => {
            let _ = reply.send(Err(DispatchError::PipelineClosed));
        },
        Command::AttemptFinished { .. } | Command::Close { .. } => {},
    }
}

fn entry_attempts_made(entry: &Entry) -> u32 {
    match entry.state {
        RetryState::Pending => 0,
        RetryState::Dispatching => entry.attempt + 1,
        RetryState::AwaitingRetry => entry.attempt,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
