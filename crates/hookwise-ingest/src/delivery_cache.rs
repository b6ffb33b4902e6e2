//! Replay protection through a cache of seen delivery identifiers.
//!
//! GitHub delivers at least once, so the same delivery identifier can arrive
//! several times. Each identifier is remembered from its first acceptance
//! until the retention window passes; entries older than that are treated as
//! absent and removed by [`DeliveryCache::garbage_collect`].
//!
//! The [`DeliveryCache`] trait is the extension point for a shared store in
//! multi-instance deployments. Implementations must make
//! [`DeliveryCache::insert_if_absent`] atomic: two concurrent deliveries of
//! one identifier must never both observe "absent".

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use hookwise_core::{Clock, DeliveryId, HookwiseError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Default retention of seen delivery identifiers.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Delivery cache backend failure.
#[derive(Debug, Clone, Error)]
#[error("delivery cache I/O error: {message}")]
pub struct CacheError {
    /// Backend failure description.
    pub message: String,
}

impl CacheError {
    /// Creates a cache error.
    pub fn io(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<CacheError> for HookwiseError {
    fn from(err: CacheError) -> Self {
        Self::CacheUnavailable { message: err.message }
    }
}

/// Store of seen delivery identifiers.
#[async_trait::async_trait]
pub trait DeliveryCache: Send + Sync + std::fmt::Debug {
    /// Returns true if `id` was seen within the retention window.
    async fn has(&self, id: &DeliveryId) -> Result<bool, CacheError>;

    /// Records `id` as first seen at `seen_at`, overwriting any entry.
    async fn add(&self, id: &DeliveryId, seen_at: DateTime<Utc>) -> Result<(), CacheError>;

    /// Records `id` unless it is live. Returns true if it was inserted.
    ///
    /// This is the check the validator relies on; it must be atomic.
    async fn insert_if_absent(
        &self,
        id: &DeliveryId,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, CacheError>;

    /// Forgets `id`. Returns true if an entry was removed.
    async fn remove(&self, id: &DeliveryId) -> Result<bool, CacheError>;

    /// Drops expired entries and returns how many were removed.
    async fn garbage_collect(&self) -> Result<usize, CacheError>;

    /// Returns the number of stored entries, expired ones included.
    async fn len(&self) -> usize;

    /// Returns true if nothing is stored.
    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// In-process delivery cache with age-based eviction.
///
/// All operations serialize on one mutex, which makes
/// `insert_if_absent` atomic within the process.
#[derive(Debug)]
pub struct InMemoryDeliveryCache {
    entries: Mutex<HashMap<DeliveryId, DateTime<Utc>>>,
    retention: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl InMemoryDeliveryCache {
    /// Creates a cache keeping entries for `retention`.
    pub fn new(retention: Duration, clock: Arc<dyn Clock>) -> Self {
        let retention = TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX);
        Self { entries: Mutex::new(HashMap::new()), retention, clock }
    }

    fn is_live(&self, first_seen_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(first_seen_at) <= self.retention
    }
}

#[async_trait::async_trait]
impl DeliveryCache for InMemoryDeliveryCache {
    async fn has(&self, id: &DeliveryId) -> Result<bool, CacheError> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        Ok(entries.get(id).is_some_and(|seen| self.is_live(*seen, now)))
    }

    async fn add(&self, id: &DeliveryId, seen_at: DateTime<Utc>) -> Result<(), CacheError> {
        self.entries.lock().await.insert(id.clone(), seen_at);
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        id: &DeliveryId,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        if entries.get(id).is_some_and(|seen| self.is_live(*seen, now)) {
            return Ok(false);
        }
        entries.insert(id.clone(), seen_at);
        Ok(true)
    }

    async fn remove(&self, id: &DeliveryId) -> Result<bool, CacheError> {
        Ok(self.entries.lock().await.remove(id).is_some())
    }

    async fn garbage_collect(&self) -> Result<usize, CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        let before = entries.len();
        entries.retain(|_, seen| self.is_live(*seen, now));
        let removed = before - entries.len();

        if removed > 0 {
            debug!(removed, remaining = entries.len(), "expired delivery ids collected");
        }
        Ok(removed)
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
