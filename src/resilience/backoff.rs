//! Exponential backoff with jitter.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Raw delay before retry number `attempt` (1-based):
/// `min(max, base * 2^(attempt-1))` with ±25% jitter, capped at `max`.
pub fn calculate_backoff(attempt: usize, config: &RetryConfig) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponent = u32::try_from(attempt - 1).unwrap_or(u32::MAX);
    let base_delay = config
        .backoff_ms
        .saturating_mul(2_u64.saturating_pow(exponent));
    let delay = base_delay.min(config.max_backoff_ms);

    let jitter = (delay as f64) * 0.25;
    let jitter_range = rand::thread_rng().gen_range(-jitter..=jitter);
    let final_delay = (delay as f64 + jitter_range).max(0.0) as u64;

    Duration::from_millis(final_delay.min(config.max_backoff_ms))
}

/// Delay actually slept: never shorter than the previous one and never above
/// the cap, so the schedule is non-decreasing despite jitter.
pub fn next_delay(attempt: usize, config: &RetryConfig, previous: Duration) -> Duration {
    let cap = Duration::from_millis(config.max_backoff_ms);
    calculate_backoff(attempt, config).max(previous).min(cap)
}
