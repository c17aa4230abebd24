//! Application-wide error types.

use thiserror::Error;

use crate::action::ErrorKind;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration. Only raised at startup or on `schedule`.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Circuit open for operation '{operation}'")]
    CircuitOpen { operation: String },

    /// Failure reported by an action; retryability follows `kind`.
    #[error("Action failed ({kind}): {message}")]
    Action { kind: ErrorKind, message: String },

    #[error("Provider '{provider}' send failed: {message}")]
    ProviderSend { provider: String, message: String },

    #[error("Job '{job}' execution failed: {message}")]
    JobExecution { job: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn action(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Action {
            kind,
            message: message.into(),
        }
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderSend {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn job(job: impl Into<String>, message: impl Into<String>) -> Self {
        Self::JobExecution {
            job: job.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Action { kind, .. } => kind.is_retryable(),
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::ProviderSend { .. } | Self::Io(_) | Self::Other(_) => true,
            _ => false,
        }
    }

    /// Classify this error as an action failure kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Action { kind, .. } => *kind,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Configuration(_) | Self::Serialization(_) | Self::Toml(_) => {
                ErrorKind::InvalidConfig
            }
            Self::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            Self::Http(e) if e.is_connect() => ErrorKind::Network,
            other => ErrorKind::classify(&other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_error_retryability_follows_kind() {
        assert!(Error::action(ErrorKind::Network, "reset").is_retryable());
        assert!(!Error::action(ErrorKind::InvalidConfig, "bad selector").is_retryable());
        assert!(!Error::config("missing clock_in").is_retryable());
    }

    #[test]
    fn test_kind_mapping() {
        let err = Error::CircuitOpen {
            operation: "punch".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(
            Error::Other("connection refused".into()).kind(),
            ErrorKind::Network
        );
    }
}
