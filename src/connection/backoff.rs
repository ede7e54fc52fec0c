//! Reconnect delay schedule (§4.2, §8 boundary behavior).
//!
//! `delay_n = min(initial * multiplier^n, max_delay)`, with optional full
//! jitter (`uniform(0, delay_n)`). Grounded in the teacher's constant
//! `sleep(Duration::from_secs(30))` retry in `master_sender.rs`, generalized
//! into the exponential schedule the spec requires.

use rand::Rng;
use std::time::Duration;

use crate::config::ConnectionPolicy;

/// Computes the delay before reconnect attempt `n` (0-indexed: the delay
/// before the *first* retry is `delay_for(policy, 0)`).
pub fn delay_for(policy: &ConnectionPolicy, attempt: u32) -> Duration {
    let raw = policy.initial_delay_ms as f64 * policy.backoff_multiplier.powi(attempt as i32);
    let capped = raw.min(policy.max_delay_ms as f64).max(0.0);
    let millis = if policy.full_jitter {
        rand::rng().random_range(0.0..=capped)
    } else {
        capped
    };
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ConnectionPolicy {
        ConnectionPolicy {
            max_streams_per_connection: 1000,
            debounce_ms: 500,
            heartbeat_timeout_ms: 60_000,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            full_jitter: false,
            max_retries: 10,
        }
    }

    #[test]
    fn delay_grows_exponentially_until_capped() {
        let p = policy();
        assert_eq!(delay_for(&p, 0), Duration::from_millis(1000));
        assert_eq!(delay_for(&p, 1), Duration::from_millis(2000));
        assert_eq!(delay_for(&p, 2), Duration::from_millis(4000));
        assert_eq!(delay_for(&p, 10), Duration::from_millis(30_000));
    }

    #[test]
    fn jittered_delay_never_exceeds_unjittered_bound() {
        let mut p = policy();
        p.full_jitter = true;
        for attempt in 0..8 {
            let bound = delay_for(&{ let mut q = p.clone(); q.full_jitter = false; q }, attempt);
            for _ in 0..20 {
                assert!(delay_for(&p, attempt) <= bound);
            }
        }
    }
}
