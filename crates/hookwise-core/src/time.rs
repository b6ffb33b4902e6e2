//! Wall-clock abstraction for replay windows and retry bookkeeping.
//!
//! Delivery cache expiry and retry record timestamps read time through
//! [`Clock`] so tests can move time forward without sleeping.

use std::{
    fmt,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};

/// Source of wall-clock timestamps.
///
/// Production code uses [`RealClock`]; tests inject [`TestClock`].
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same offset, so advancing one handle is visible through
/// every component holding another.
#[derive(Debug, Clone)]
pub struct TestClock {
    base: DateTime<Utc>,
    offset_ms: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a test clock frozen at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a test clock frozen at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self { base: start, offset_ms: Arc::new(AtomicI64::new(0)) }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        let ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.offset_ms.fetch_add(ms, Ordering::AcqRel);
    }

    /// Sets the clock to an absolute time. Moving backwards is allowed.
    pub fn jump_to(&self, time: DateTime<Utc>) {
        let offset = (time - self.base).num_milliseconds();
        self.offset_ms.store(offset, Ordering::Release);
    }

    /// Returns how far the clock has moved since creation.
    pub fn elapsed(&self) -> Duration {
        let ms = self.offset_ms.load(Ordering::Acquire);
        Duration::from_millis(u64::try_from(ms).unwrap_or(0))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        self.base + TimeDelta::milliseconds(self.offset_ms.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_clock_advances_all_clones() {
        let clock = TestClock::new();
        let observer = clock.clone();
        let start = observer.now();

        clock.advance(Duration::from_secs(90));

        assert_eq!(observer.now() - start, TimeDelta::seconds(90));
        assert_eq!(clock.elapsed(), Duration::from_secs(90));
    }

    #[test]
    fn test_clock_jumps_backwards() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = TestClock::starting_at(start);

        clock.advance(Duration::from_secs(3600));
        clock.jump_to(start - TimeDelta::minutes(5));

        assert_eq!(clock.now(), start - TimeDelta::minutes(5));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn real_clock_tracks_system_time() {
        let before = Utc::now();
        let observed = RealClock::new().now();
        assert!(observed >= before);
    }
}
