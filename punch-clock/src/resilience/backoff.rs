//! Exponential backoff with bounded jitter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.25
}

/// Maps an attempt number to the wait inserted after it.
///
/// `wait(k) = min(base * multiplier^(k-1) * (1 + j), max)` where `j` is drawn
/// uniformly from `[0, jitter]`. As long as `multiplier >= 1 + jitter` the
/// sequence is non-decreasing and becomes constant once the cap is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Maximum jitter as a fraction of the un-jittered delay.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::config(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if !self.jitter.is_finite() || self.jitter < 0.0 {
            return Err(Error::config(format!(
                "backoff jitter must be >= 0.0, got {}",
                self.jitter
            )));
        }
        if self.jitter > self.multiplier - 1.0 {
            return Err(Error::config(format!(
                "backoff jitter {} must not exceed multiplier - 1 ({})",
                self.jitter,
                self.multiplier - 1.0
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::config(format!(
                "max_delay_ms ({}) must be >= base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }

    /// Deterministic part of the delay after `attempt` (1-based), before the cap.
    fn raw_delay_ms(&self, attempt: u32) -> f64 {
        self.base_delay_ms as f64 * self.multiplier.powi(attempt.saturating_sub(1) as i32)
    }

    /// Un-jittered delay after `attempt`, capped.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let ms = self.raw_delay_ms(attempt).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = self.raw_delay_ms(attempt);
        let jittered = raw * (1.0 + self.jitter * rand::random::<f64>());
        Duration::from_millis(jittered.min(self.max_delay_ms as f64) as u64)
    }
}
