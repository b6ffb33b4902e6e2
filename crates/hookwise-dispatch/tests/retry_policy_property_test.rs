//! Property-based tests for the backoff schedule.

use std::time::Duration;

use hookwise_dispatch::{RetryDecision, RetryPolicy};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

fn policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (0u32..20, 1u64..5_000, 1u64..600, 1.0f64..4.0, 0.0f64..=1.0).prop_map(
        |(max_retries, initial_ms, max_factor, backoff_factor, jitter)| RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(initial_ms),
            max_backoff: Duration::from_millis(initial_ms * max_factor),
            backoff_factor,
            jitter,
        },
    )
}

fn proptest_config() -> ProptestConfig {
    ProptestConfig { cases: 256, failure_persistence: None, ..ProptestConfig::default() }
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn backoff_is_monotonic_and_capped(policy in policy_strategy(), attempt in 0u32..64) {
        let current = policy.backoff_for(attempt);
        let next = policy.backoff_for(attempt + 1);

        prop_assert!(next >= current, "backoff decreased: {current:?} -> {next:?}");
        prop_assert!(next <= policy.max_backoff);
    }

    #[test]
    fn jittered_delay_stays_within_bounds(policy in policy_strategy(), attempt in 0u32..32) {
        let base = policy.backoff_for(attempt).as_secs_f64();
        let delay = policy.delay_for(attempt);

        let lower = base * (1.0 - policy.jitter) - 1e-6;
        prop_assert!(delay.as_secs_f64() >= lower.max(0.0), "{delay:?} below {lower}");
        prop_assert!(delay <= policy.max_backoff);
    }

    #[test]
    fn exhaustion_happens_exactly_after_max_retries(
        policy in policy_strategy(),
        attempt in 0u32..40,
    ) {
        match policy.decide(attempt) {
            RetryDecision::Retry { attempt: next, delay } => {
                prop_assert!(attempt < policy.max_retries);
                prop_assert_eq!(next, attempt + 1);
                prop_assert!(delay <= policy.max_backoff);
            },
            RetryDecision::Exhausted { attempts } => {
                prop_assert!(attempt >= policy.max_retries);
                prop_assert_eq!(attempts, attempt + 1);
            },
        }
    }
}
