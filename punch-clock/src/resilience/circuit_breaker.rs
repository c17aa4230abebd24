//! Circuit breaker keyed by operation name.
//!
//! A breaker starts `Closed`. After `failure_threshold` consecutive failures it
//! opens and rejects every attempt until `cooldown` has elapsed, then admits a
//! single probe (`HalfOpen`). The probe's outcome closes or re-opens it.
//!
//! Admission hands out an [`AttemptPermit`]. A probe permit dropped before
//! its outcome is recorded, e.g. when the caller timed out, re-opens the
//! circuit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{Error, Result};

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    300
}

/// Breaker settings shared by every operation of a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a probe is allowed.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown_secs: cooldown.as_secs(),
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::config("circuit breaker failure_threshold must be >= 1"));
        }
        Ok(())
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing, attempts are rejected.
    Open,
    /// Cool-down elapsed, one probe is allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub operation: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_probe_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_failure_at: Option<DateTime<Utc>>,
    last_probe_at: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.probe_in_flight = false;
    }
}

/// Circuit breaker for a single operation.
///
/// All transitions happen under one lock, so a transition made by one caller
/// is visible to the next caller before it is admitted.
pub struct CircuitBreaker {
    operation: String,
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
    /// Serializes whole runs against this operation.
    run_lock: tokio::sync::Mutex<()>,
}

impl CircuitBreaker {
    pub fn new(operation: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            operation: operation.into(),
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                last_failure_at: None,
                last_probe_at: None,
            }),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Move `Open` to `HalfOpen` once the cool-down has elapsed.
    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.cooldown
        {
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
            debug!(operation = %self.operation, "Circuit breaker transitioned to half-open");
        }
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.state.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Ask whether an attempt may proceed.
    ///
    /// In `HalfOpen` only the first caller is admitted; later callers are
    /// rejected until the probe's outcome is recorded or its permit dropped.
    pub fn try_acquire(&self) -> Option<AttemptPermit<'_>> {
        let mut inner = self.state.lock();
        self.refresh(&mut inner);

        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => return None,
            CircuitState::HalfOpen if inner.probe_in_flight => return None,
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                inner.last_probe_at = Some(Utc::now());
                debug!(operation = %self.operation, "Circuit breaker admitting probe");
                true
            }
        };

        Some(AttemptPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    /// A permit was dropped without an outcome.
    fn abandon(&self, probe: bool) {
        let mut inner = self.state.lock();
        if !probe || inner.state != CircuitState::HalfOpen || !inner.probe_in_flight {
            debug!(operation = %self.operation, "Attempt abandoned");
            return;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(Utc::now());
        inner.open();
        warn!(operation = %self.operation, "Circuit breaker probe abandoned, reopening");
    }

    /// Record a successful attempt.
    pub fn record_success(&self) {
        let mut inner = self.state.lock();

        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                info!(operation = %self.operation, "Circuit breaker closed after successful probe");
            }
            CircuitState::Open => {
                // An attempt admitted before the circuit opened finished late.
                debug!(operation = %self.operation, "Ignoring success while circuit is open");
            }
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&self) {
        let mut inner = self.state.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.open();
                    warn!(
                        operation = %self.operation,
                        failures = inner.consecutive_failures,
                        cooldown = ?self.cooldown,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.open();
                warn!(operation = %self.operation, "Circuit breaker probe failed, reopening");
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker back to `Closed`.
    pub fn reset(&self) {
        let mut inner = self.state.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        debug!(operation = %self.operation, "Circuit breaker reset");
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.state.lock();
        self.refresh(&mut inner);
        CircuitSnapshot {
            operation: self.operation.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            last_probe_at: inner.last_probe_at,
        }
    }

    /// Hold exclusive access to this operation for the duration of a run.
    pub async fn lock_operation(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.run_lock.lock().await
    }
}

/// Admission of a single attempt, obtained from [`CircuitBreaker::try_acquire`].
///
/// Settle it with [`succeeded`](Self::succeeded) or [`failed`](Self::failed).
/// Dropping an unsettled probe permit counts as a failed probe; dropping any
/// other permit leaves the breaker untouched.
#[must_use = "an unsettled probe permit re-opens the circuit when dropped"]
pub struct AttemptPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl AttemptPermit<'_> {
    /// Whether this attempt is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failed(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for AttemptPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon(self.probe);
        }
    }
}

/// Circuit breakers per operation name, created on first use.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get or create the breaker for an operation.
    pub fn get(&self, operation: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(operation) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(operation, &self.config)))
            .clone()
    }

    /// Snapshots of every known breaker, sorted by operation name.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.read().values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.operation.cmp(&b.operation));
        snapshots
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
