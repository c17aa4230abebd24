//! The punch action contract.
//!
//! The scheduler never knows how a punch is performed. It only invokes an
//! [`Action`] and receives an [`ActionOutcome`]. Expected failures are encoded
//! as `ActionOutcome::Failure` with an [`ErrorKind`]; the retry layer decides
//! from the kind whether another attempt is worthwhile.

mod command;

pub use command::CommandAction;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection dropped, refused or reset.
    Network,
    /// The remote side did not answer in time.
    Timeout,
    /// The remote side asked us to slow down.
    RateLimited,
    /// The remote side answered with an error.
    Remote,
    /// Credentials were rejected.
    Authentication,
    /// Local configuration is wrong; retrying cannot help.
    InvalidConfig,
    /// The circuit breaker rejected the attempt.
    CircuitOpen,
    /// Anything that could not be classified.
    Unknown,
}

impl ErrorKind {
    /// Whether a failure of this kind is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Authentication | Self::InvalidConfig | Self::CircuitOpen
        )
    }

    /// Best-effort classification of a free-form error message.
    pub fn classify(message: &str) -> Self {
        const NETWORK_KEYWORDS: [&str; 7] = [
            "connection",
            "network",
            "disconnected",
            "reset",
            "refused",
            "unreachable",
            "aborted",
        ];

        let lower = message.to_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout
        } else if NETWORK_KEYWORDS.iter().any(|k| lower.contains(k)) {
            Self::Network
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Remote => "remote",
            Self::Authentication => "authentication",
            Self::InvalidConfig => "invalid_config",
            Self::CircuitOpen => "circuit_open",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details reported by a successful attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionDetail {
    pub message: String,
    /// Optional artifact produced by the action, e.g. a screenshot.
    pub attachment: Option<PathBuf>,
    pub fields: Vec<(String, String)>,
}

impl ActionDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachment = Some(path.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }
}

/// Result of a single action invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Success(ActionDetail),
    Failure { kind: ErrorKind, message: String },
}

impl ActionOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self::Success(ActionDetail::new(message))
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Failure kind, or `None` on success.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Success(_) => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }

    /// Human readable summary of the outcome.
    pub fn message(&self) -> &str {
        match self {
            Self::Success(detail) => &detail.message,
            Self::Failure { message, .. } => message,
        }
    }
}

impl From<crate::Error> for ActionOutcome {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Action { kind, message } => Self::Failure { kind, message },
            other => Self::Failure {
                kind: other.kind(),
                message: other.to_string(),
            },
        }
    }
}

/// A zero-argument operation producing an [`ActionOutcome`].
#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self) -> ActionOutcome;
}

/// Adapts an async closure into an [`Action`].
pub struct FnAction<F>(F);

impl<F, Fut> FnAction<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionOutcome> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }

    pub fn shared(f: F) -> Arc<dyn Action> {
        Arc::new(Self(f))
    }
}

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionOutcome> + Send + 'static,
{
    async fn run(&self) -> ActionOutcome {
        (self.0)().await
    }
}

/// The two daily punches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunchKind {
    ClockIn,
    ClockOut,
}

impl PunchKind {
    pub const ALL: [PunchKind; 2] = [PunchKind::ClockIn, PunchKind::ClockOut];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClockIn => "clock_in",
            Self::ClockOut => "clock_out",
        }
    }

    /// Scheduler job identifier for this punch.
    pub fn job_id(&self) -> &'static str {
        match self {
            Self::ClockIn => "clock_in_job",
            Self::ClockOut => "clock_out_job",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::ClockIn => "Clock in",
            Self::ClockOut => "Clock out",
        }
    }
}

impl fmt::Display for PunchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PunchKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "clock_in" | "in" => Ok(Self::ClockIn),
            "clock_out" | "out" => Ok(Self::ClockOut),
            other => Err(crate::Error::config(format!("unknown punch kind '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_messages() {
        assert_eq!(ErrorKind::classify("Request timed out"), ErrorKind::Timeout);
        assert_eq!(
            ErrorKind::classify("Connection reset by peer"),
            ErrorKind::Network
        );
        assert_eq!(ErrorKind::classify("host unreachable"), ErrorKind::Network);
        assert_eq!(ErrorKind::classify("element not found"), ErrorKind::Unknown);
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(!ErrorKind::InvalidConfig.is_retryable());
        assert!(!ErrorKind::Authentication.is_retryable());
        assert!(!ErrorKind::CircuitOpen.is_retryable());
        assert!(ErrorKind::Unknown.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
    }

    #[test]
    fn test_punch_kind_parse() {
        assert_eq!("clock-in".parse::<PunchKind>().unwrap(), PunchKind::ClockIn);
        assert_eq!("CLOCK_OUT".parse::<PunchKind>().unwrap(), PunchKind::ClockOut);
        assert!("lunch".parse::<PunchKind>().is_err());
    }

    #[tokio::test]
    async fn test_fn_action() {
        let action = FnAction::shared(|| async { ActionOutcome::success("ok") });
        assert_eq!(action.run().await, ActionOutcome::success("ok"));
    }
}
