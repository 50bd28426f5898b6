//! Delay policy between transient bootstrap connection attempts.

use rand::Rng;
use std::time::Duration;

/// Capped backoff with optional jitter.
///
/// The default is a fixed 5 second pause — freshly launched instances come
/// up on their own schedule and polling faster buys nothing — but callers
/// fanning out many bootstraps at once can enable exponential growth with
/// jitter to spread the load.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl BackoffPolicy {
    /// The same delay for every attempt.
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            base_delay_ms: ms,
            max_delay_ms: ms,
            jitter: false,
        }
    }

    /// Exponential growth from `base` capped at `max`, with ±10% jitter.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            jitter: true,
        }
    }

    /// Delay before the given attempt (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay_ms(attempt);
        let ms = if self.jitter {
            Self::apply_jitter(raw).min(self.max_delay_ms)
        } else {
            raw
        };
        Duration::from_millis(ms)
    }

    fn raw_delay_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.min(63);
        let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(multiplier);
        delay.min(self.max_delay_ms)
    }

    fn apply_jitter(delay_ms: u64) -> u64 {
        let mut rng = rand::thread_rng();
        let jitter: f64 = rng.gen_range(0.9..=1.1);
        ((delay_ms as f64) * jitter).round().max(0.0) as u64
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}
