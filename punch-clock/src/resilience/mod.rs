//! Retry and circuit breaking for flaky remote operations.

mod backoff;
mod circuit_breaker;
mod retry;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{
    AttemptPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot,
    CircuitState,
};
pub use retry::{RetryExecutor, RetryPolicy, RetryReport};
