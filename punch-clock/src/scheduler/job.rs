//! Scheduled jobs.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use super::trigger::Trigger;
use crate::action::{Action, PunchKind};
use crate::notification::{NotificationEvent, NotificationLevel};
use crate::resilience::{RetryPolicy, RetryReport};
use crate::{Error, Result};

/// Circuit breaker key shared by both punch jobs.
pub const PUNCH_OPERATION: &str = "punch";

/// A trigger bound to an action.
#[derive(Clone)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    pub action: Arc<dyn Action>,
    pub enabled: bool,
    /// Circuit breaker key the action runs under.
    pub operation: String,
    /// Overrides the scheduler's retry policy.
    pub retry: Option<RetryPolicy>,
    /// Set for the two punch jobs; shapes the result notification.
    pub punch: Option<PunchKind>,
}

impl Job {
    pub fn new(id: impl Into<String>, trigger: Trigger, action: Arc<dyn Action>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            operation: id.clone(),
            id,
            trigger,
            action,
            enabled: true,
            retry: None,
            punch: None,
        }
    }

    /// The daily job for one punch kind.
    pub fn punch(kind: PunchKind, trigger: Trigger, action: Arc<dyn Action>) -> Self {
        Self::new(kind.job_id(), trigger, action)
            .with_name(kind.label())
            .with_operation(PUNCH_OPERATION)
            .with_punch(kind)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_punch(mut self, kind: PunchKind) -> Self {
        self.punch = Some(kind);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::config("job id must not be empty"));
        }
        if self.operation.trim().is_empty() {
            return Err(Error::config(format!(
                "job '{}': operation must not be empty",
                self.id
            )));
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }

    /// Notification describing a finished run.
    pub fn result_event(&self, report: &RetryReport) -> NotificationEvent {
        if let Some(kind) = self.punch {
            return NotificationEvent::punch_result(kind, report);
        }

        let (level, verb) = if report.is_success() {
            (NotificationLevel::Success, "succeeded")
        } else {
            (NotificationLevel::Error, "failed")
        };
        let mut event = NotificationEvent::new(level, format!("{} {verb}", self.name))
            .with_description(report.outcome.message())
            .with_field("Job", self.id.clone())
            .with_field("Attempts", report.attempts.to_string());
        if let Some(kind) = report.outcome.error_kind() {
            event = event.with_field("Error", kind.as_str());
        }
        event
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .field("enabled", &self.enabled)
            .field("operation", &self.operation)
            .field("punch", &self.punch)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a scheduled job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    pub enabled: bool,
    pub running: bool,
    pub next_fire: Option<DateTime<Tz>>,
    pub last_fire: Option<DateTime<Utc>>,
    /// Summary of the most recent run, e.g. `success` or `failure (timeout)`.
    pub last_outcome: Option<String>,
    pub run_count: u64,
}
