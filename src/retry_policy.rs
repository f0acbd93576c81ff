//! Backoff calculations for requeue delays and idle polling

use std::time::Duration;
use rand::Rng;

/// Delay before a failed message becomes claimable again.
///
/// Exponential: base, 2×base, 4×base... capped at `max`, plus uniform jitter
/// in `[0, jitter]` so workers that failed together do not retry together.
pub fn requeue_delay(attempts: u32, base: Duration, max: Duration, jitter: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempts.min(31)).unwrap_or(u32::MAX);
    let exp = base.checked_mul(factor).unwrap_or(max).min(max);

    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return exp;
    }
    exp + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

/// Tracks the sleep between empty claims for one worker
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl IdleBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, current: min }
    }

    /// Sleep to use now; doubles the next one up to `max`
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max).max(self.min);
        delay
    }

    /// Work was found; start again from `min`
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
