//! Notification events.
//!
//! Defines the events published to notification providers and their levels.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::{ActionOutcome, PunchKind};
use crate::resilience::RetryReport;

/// Severity of a notification.
///
/// Ordered `Info < Success < Warning < Error`; a provider with a minimum
/// level only receives events at or above it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl NotificationLevel {
    /// Embed color for this level.
    pub fn color(&self) -> u32 {
        match self {
            Self::Success => 0x00ff00, // Green
            Self::Warning => 0xffaa00, // Yellow
            Self::Error => 0xff0000,   // Red
            Self::Info => 0x0099ff,    // Blue
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "success" => Ok(Self::Success),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(crate::Error::config(format!(
                "unknown notification level '{other}'"
            ))),
        }
    }
}

/// What produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Punch,
    Scheduler,
    ConnectionTest,
    Custom,
}

/// Scheduler lifecycle moments worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEventKind {
    Started,
    Stopped,
    Error,
}

/// A single notification, rendered independently by every provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    pub kind: EventKind,
    pub level: NotificationLevel,
    pub title: String,
    pub description: String,
    /// Ordered name/value pairs.
    pub fields: Vec<(String, String)>,
    /// File to upload alongside the message, if the provider supports it.
    pub attachment: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(level: NotificationLevel, title: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Custom,
            level,
            title: title.into(),
            description: String::new(),
            fields: Vec::new(),
            attachment: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachment = Some(path.into());
        self
    }

    fn with_kind(mut self, kind: EventKind) -> Self {
        self.kind = kind;
        self
    }

    /// Outcome of a punch run.
    pub fn punch_result(punch: PunchKind, report: &RetryReport) -> Self {
        let (level, title) = if report.is_success() {
            (
                NotificationLevel::Success,
                format!("{} succeeded", punch.label()),
            )
        } else {
            (
                NotificationLevel::Error,
                format!("{} failed", punch.label()),
            )
        };

        let mut event = Self::new(level, title)
            .with_kind(EventKind::Punch)
            .with_description(report.outcome.message())
            .with_field("Action", punch.as_str())
            .with_field("Attempts", report.attempts.to_string());

        match &report.outcome {
            ActionOutcome::Success(detail) => {
                for (name, value) in &detail.fields {
                    event = event.with_field(name.clone(), value.clone());
                }
                if let Some(path) = &detail.attachment {
                    event = event.with_attachment(path.clone());
                }
            }
            ActionOutcome::Failure { kind, .. } => {
                event = event.with_field("Error", kind.as_str());
            }
        }

        if report.is_success()
            && let Some(last_error) = &report.last_error
        {
            event = event.with_field("Recovered from", last_error.clone());
        }
        if !report.elapsed_backoff.is_zero() {
            event = event.with_field(
                "Backoff",
                format!("{:.1}s", report.elapsed_backoff.as_secs_f64()),
            );
        }

        event
    }

    /// Scheduler lifecycle or failure notice.
    pub fn scheduler(kind: SchedulerEventKind, message: impl Into<String>) -> Self {
        let (level, title) = match kind {
            SchedulerEventKind::Started => (NotificationLevel::Info, "Scheduler started"),
            SchedulerEventKind::Stopped => (NotificationLevel::Info, "Scheduler stopped"),
            SchedulerEventKind::Error => (NotificationLevel::Error, "Scheduler error"),
        };
        Self::new(level, title)
            .with_kind(EventKind::Scheduler)
            .with_description(message)
    }

    /// Minimal synthetic event used to check that a provider is reachable.
    pub fn connection_test(app_name: &str) -> Self {
        Self::new(NotificationLevel::Info, "Connection test")
            .with_kind(EventKind::ConnectionTest)
            .with_description(format!("{app_name} notification channel is reachable"))
    }

    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::Punch => "punch",
            EventKind::Scheduler => "scheduler",
            EventKind::ConnectionTest => "connection_test",
            EventKind::Custom => "custom",
        }
    }
}
