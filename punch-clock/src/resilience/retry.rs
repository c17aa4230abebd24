//! Bounded retries guarded by a per-operation circuit breaker.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::circuit_breaker::{CircuitBreakerRegistry, CircuitState};
use crate::action::{Action, ActionOutcome, ErrorKind};
use crate::{Error, Result};

fn default_max_attempts() -> u32 {
    3
}

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Hard upper bound on invocations per run.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(flatten)]
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config("retry max_attempts must be >= 1"));
        }
        self.backoff.validate()
    }
}

/// Bookkeeping for a single run.
#[derive(Debug, Default)]
struct RetryState {
    attempts: u32,
    last_error: Option<String>,
    elapsed_backoff: Duration,
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryReport {
    pub operation: String,
    pub outcome: ActionOutcome,
    /// Number of times the operation was actually invoked.
    pub attempts: u32,
    /// Message of the most recent failed attempt, if any.
    pub last_error: Option<String>,
    /// Total time spent waiting between attempts.
    pub elapsed_backoff: Duration,
}

impl RetryReport {
    fn finish(operation: &str, outcome: ActionOutcome, state: RetryState) -> Self {
        Self {
            operation: operation.to_string(),
            outcome,
            attempts: state.attempts,
            last_error: state.last_error,
            elapsed_backoff: state.elapsed_backoff,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs operations with bounded retries and circuit breaking.
///
/// Runs against the same operation name are serialized, so a half-open
/// breaker only ever sees one probe.
#[derive(Clone)]
pub struct RetryExecutor {
    breakers: Arc<CircuitBreakerRegistry>,
    cancel_token: CancellationToken,
}

impl RetryExecutor {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            breakers,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Abandon pending backoff waits when `token` is cancelled.
    ///
    /// An attempt already in flight is never interrupted.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Run an [`Action`] under `policy`.
    pub async fn run_action(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        action: &dyn Action,
    ) -> RetryReport {
        self.run(operation, policy, move || action.run()).await
    }

    /// Run `attempt` until it succeeds, fails terminally, the breaker rejects
    /// it, or `policy.max_attempts` invocations have been made.
    pub async fn run<F, Fut>(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        mut attempt: F,
    ) -> RetryReport
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ActionOutcome>,
    {
        let breaker = self.breakers.get(operation);
        let _serialized = breaker.lock_operation().await;

        let max_attempts = policy.max_attempts.max(1);
        let mut state = RetryState::default();

        loop {
            let Some(permit) = breaker.try_acquire() else {
                warn!(
                    operation = %operation,
                    attempts = state.attempts,
                    "Circuit open, aborting run"
                );
                let outcome = ActionOutcome::failure(
                    ErrorKind::CircuitOpen,
                    format!("circuit open for operation '{operation}'"),
                );
                return RetryReport::finish(operation, outcome, state);
            };

            state.attempts += 1;
            debug!(operation = %operation, attempt = state.attempts, max_attempts, "Starting attempt");

            let outcome = match AssertUnwindSafe(attempt()).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => ActionOutcome::failure(
                    ErrorKind::Unknown,
                    format!("action panicked: {}", panic_message(payload.as_ref())),
                ),
            };

            let Some(kind) = outcome.error_kind() else {
                permit.succeeded();
                if state.attempts > 1 {
                    info!(operation = %operation, attempts = state.attempts, "Succeeded after retry");
                }
                return RetryReport::finish(operation, outcome, state);
            };
            let message = outcome.message().to_string();

            permit.failed();
            state.last_error = Some(message.clone());

            if !kind.is_retryable() {
                warn!(
                    operation = %operation,
                    attempt = state.attempts,
                    kind = %kind,
                    error = %message,
                    "Terminal failure, not retrying"
                );
                return RetryReport::finish(operation, outcome, state);
            }

            if state.attempts >= max_attempts {
                warn!(
                    operation = %operation,
                    attempts = state.attempts,
                    kind = %kind,
                    error = %message,
                    "Retry attempts exhausted"
                );
                return RetryReport::finish(operation, outcome, state);
            }

            if breaker.state() == CircuitState::Open {
                warn!(
                    operation = %operation,
                    attempts = state.attempts,
                    error = %message,
                    "Circuit opened, aborting run"
                );
                let outcome = ActionOutcome::failure(
                    ErrorKind::CircuitOpen,
                    format!("circuit open for operation '{operation}'"),
                );
                return RetryReport::finish(operation, outcome, state);
            }

            let delay = policy.backoff.delay_for_attempt(state.attempts);
            warn!(
                operation = %operation,
                attempt = state.attempts,
                kind = %kind,
                error = %message,
                delay = ?delay,
                "Attempt failed, backing off"
            );

            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => {
                    info!(operation = %operation, attempts = state.attempts, "Shutdown requested, abandoning retries");
                    return RetryReport::finish(operation, outcome, state);
                }
                _ = tokio::time::sleep(delay) => {
                    state.elapsed_backoff += delay;
                }
            }
        }
    }
}
