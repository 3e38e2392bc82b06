use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential retry backoff with a cap and proportional jitter.
///
/// The delay before retry `n` (1-based) is
/// `min(base * multiplier^(n-1), max)`, then reduced by a random fraction of
/// at most `jitter` so that workers retrying the same outage spread out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_secs: u64,
    pub max_secs: u64,
    pub multiplier: f64,
    /// Fraction in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_secs: 30,
            max_secs: 3600,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry following `attempt` failed attempts, without jitter.
    pub fn ceiling_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.base_secs as f64 * self.multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_secs as f64)
        } else {
            self.max_secs as f64
        };
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay before the next retry, with random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let unit = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with(attempt, unit)
    }

    /// Delay with jitter drawn as `unit` in `[0, 1]`.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let ceiling = self.ceiling_for(attempt);
        let reduction = self.jitter.clamp(0.0, 1.0) * unit.clamp(0.0, 1.0);
        ceiling.mul_f64(1.0 - reduction)
    }
}
