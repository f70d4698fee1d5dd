//! Retry policy for recoverable tool failures: exponential backoff with jitter.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts per call, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub base_delay_ms: u64,
    /// Multiplier for each subsequent wait (exponential factor).
    pub backoff_factor: f64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Add ±25% random jitter to the computed delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 2_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Compute the delay before retry `attempt_number` (1-indexed).
    pub fn delay_for(&self, attempt_number: u32) -> Duration {
        if attempt_number == 0 {
            return Duration::ZERO;
        }
        let delay_ms =
            self.base_delay_ms as f64 * self.backoff_factor.powi((attempt_number - 1) as i32);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64) as u64;

        let delay_ms = if self.jitter {
            let jitter = (delay_ms / 4) as i64;
            let offset: i64 = if jitter > 0 {
                (rand_offset() % (jitter as u64 * 2)) as i64 - jitter
            } else {
                0
            };
            (delay_ms as i64 + offset).max(0) as u64
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms)
    }

    /// `attempts_made` counts the attempts already run, the first included.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before the next retry, or `None` when it would not finish
    /// waiting within `remaining_ms`.
    pub fn delay_within(&self, attempt_number: u32, remaining_ms: u64) -> Option<Duration> {
        let delay = self.delay_for(attempt_number);
        (delay.as_millis() < remaining_ms as u128).then_some(delay)
    }
}

/// xorshift64 for jitter without pulling in a full rand dep.
fn rand_offset() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEED: AtomicU64 = AtomicU64::new(0x123456789abcdef0);
    let x = SEED.load(Ordering::Relaxed);
    let x = x ^ (x << 13);
    let x = x ^ (x >> 7);
    let x = x ^ (x << 17);
    SEED.store(x, Ordering::Relaxed);
    x
}
