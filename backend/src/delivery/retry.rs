//! Exponential backoff shared by render and delivery retries.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry parameters. `max_attempts` counts the first try, so `1` disables retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    /// Fraction of the delay added or removed at random, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !(self.factor >= 1.0) {
            return Err("factor must be at least 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("jitter must be between 0 and 1".to_string());
        }
        Ok(())
    }

    /// Un-jittered delay after `failures` failed attempts (`failures >= 1`).
    pub fn base_delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let millis = self.base_delay_ms as f64 * self.factor.powi(exponent);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        let base = self.base_delay_for(failures);
        if self.jitter == 0.0 {
            return base;
        }
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        base.mul_f64(1.0 + spread)
    }

    pub fn start(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            failures: 0,
        }
    }
}

/// Retry bookkeeping for one operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    /// Number of the attempt currently in progress, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.failures + 1
    }

    /// Records a failed attempt. Returns how long to wait before the next one,
    /// or `None` once the attempt ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            return None;
        }
        Some(self.policy.delay_for(self.failures))
    }
}
