//! Exponential backoff policy with jitter.
//!
//! After failed attempt `n` (0-based) the next attempt waits
//! `initial_backoff * backoff_factor^n`, capped at `max_backoff`, then
//! randomized by up to `jitter` of itself and capped again. Attempt 0 runs
//! immediately and a delivery is exhausted once `max_retries` retries have
//! failed.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff configuration for failed dispatch attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,

    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,

    /// Upper bound on any single delay.
    pub max_backoff: Duration,

    /// Multiplier applied per failed attempt.
    pub backoff_factor: f64,

    /// Relative jitter (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3600),
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }
}

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run `attempt` after `delay`.
    Retry {
        /// 0-based number of the next attempt
        attempt: u32,
        /// Wait before running it
        delay: Duration,
    },
    /// No attempts remain.
    Exhausted {
        /// Attempts made in total
        attempts: u32,
    },
}

impl RetryPolicy {
    /// Attempts made before a delivery is exhausted.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Un-jittered delay after failed attempt `failed_attempt`.
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let exponent = i32::try_from(failed_attempt).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }

        Duration::try_from_secs_f64(secs).unwrap_or(self.max_backoff)
    }

    /// Jittered delay after failed attempt `failed_attempt`, never above
    /// `max_backoff`.
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        apply_jitter(self.backoff_for(failed_attempt), self.jitter).min(self.max_backoff)
    }

    /// Decides what follows failed attempt `failed_attempt`.
    pub fn decide(&self, failed_attempt: u32) -> RetryDecision {
        let next = failed_attempt.saturating_add(1);
        if next > self.max_retries {
            RetryDecision::Exhausted { attempts: next }
        } else {
            RetryDecision::Retry { attempt: next, delay: self.delay_for(failed_attempt) }
        }
    }

    /// Policy with short delays and no jitter, for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }
}

fn apply_jitter(duration: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped = jitter.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let range = duration.as_secs_f64() * clamped;
    let offset = rng.random_range(-range..=range);
    let jittered = duration.as_secs_f64() + offset;

    Duration::from_secs_f64(jittered.max(0.0))
}
