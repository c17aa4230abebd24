//! Minimum-interval rate limiting for notification providers.
//!
//! Sends are never dropped: a caller that arrives too early waits until the
//! interval since the previous send has elapsed.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Mutable limiter bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct RateLimiterState {
    /// When the most recent send attempt was released.
    pub last_send: Option<Instant>,
    /// Server-imposed pause, e.g. from a `Retry-After` header.
    pub blocked_until: Option<Instant>,
}

impl RateLimiterState {
    fn next_allowed(&self, interval: Duration) -> Option<Instant> {
        let after_interval = self.last_send.map(|t| t + interval);
        match (after_interval, self.blocked_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Per-provider limiter enforcing a minimum interval between sends.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    state: Mutex<RateLimiterState>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(RateLimiterState::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until a send is allowed and record it.
    ///
    /// Callers are released one at a time in arrival order. Cancel safe: if
    /// the returned future is dropped while waiting, no send is recorded.
    ///
    /// Returns the time spent waiting.
    pub async fn acquire(&self) -> Duration {
        let mut state = self.state.lock().await;
        let started = Instant::now();

        if let Some(next) = state.next_allowed(self.interval)
            && next > started
        {
            let wait = next - started;
            debug!(wait = ?wait, "Rate limited, waiting");
            tokio::time::sleep_until(next).await;
        }

        let now = Instant::now();
        state.last_send = Some(now);
        state.blocked_until = None;
        now - started
    }

    /// Hold off the next send for at least `duration` from now.
    pub async fn defer(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut state = self.state.lock().await;
        state.blocked_until = Some(state.blocked_until.map_or(until, |b| b.max(until)));
    }

    pub async fn snapshot(&self) -> RateLimiterState {
        *self.state.lock().await
    }
}
