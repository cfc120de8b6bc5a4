//! Small helpers shared across the turn engine and client.

use std::time::Duration;

use rand::Rng;

const BACKOFF_FACTOR: f64 = 2.0;

/// Exponential backoff with jitter for the `attempt`-th retry (1-indexed):
/// `base * factor^(attempt-1)`, scaled by a `0.9..1.1` jitter factor so a
/// burst of concurrent retries doesn't all wake up on the same tick.
pub fn backoff(attempt: u64, base: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let scaled = base.as_secs_f64() * BACKOFF_FACTOR.powi(exponent);
    let jitter = rand::rng().random_range(0.9..1.1);
    Duration::from_secs_f64(scaled * jitter)
}
