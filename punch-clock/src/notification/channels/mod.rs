//! Notification providers.
//!
//! Each provider turns a [`NotificationEvent`] into one external delivery:
//! - Discord webhooks (embeds, optional file upload)
//! - Generic webhooks (JSON over HTTP)
//!
//! A provider only performs a single attempt. Rate limiting, retries and
//! circuit breaking are layered on top by the dispatcher.

mod discord;
mod webhook;

pub use discord::{DISCORD_MAX_ATTACHMENT_BYTES, DiscordConfig, DiscordProvider};
pub use webhook::{WebhookAuth, WebhookConfig, WebhookProvider};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::events::{NotificationEvent, NotificationLevel};
use crate::action::ErrorKind;
use crate::{Error, Result};

/// Why a single delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DeliveryError {
    pub kind: ErrorKind,
    pub message: String,
    /// Pause requested by the remote side before the next attempt.
    pub retry_after: Option<Duration>,
}

impl DeliveryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Map a non-success HTTP status onto a failure kind.
    pub fn from_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> Self {
        let kind = match status.as_u16() {
            429 => ErrorKind::RateLimited,
            401 | 403 | 404 => ErrorKind::Authentication,
            400..=499 => ErrorKind::InvalidConfig,
            _ => ErrorKind::Remote,
        };
        let body = body.trim();
        let message = if body.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {}", body.chars().take(200).collect::<String>())
        };
        Self {
            kind,
            message,
            retry_after,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() {
            ErrorKind::Network
        } else if err.is_builder() {
            ErrorKind::InvalidConfig
        } else {
            match ErrorKind::classify(&err.to_string()) {
                ErrorKind::Unknown => ErrorKind::Network,
                kind => kind,
            }
        };
        Self::new(kind, err.to_string())
    }
}

/// Parse `Retry-After` (seconds) or `X-RateLimit-Reset-After` from a response.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    ["Retry-After", "X-RateLimit-Reset-After"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok()?.trim().parse::<f64>().ok())
        .find(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Read an attachment if it exists and fits under `max_bytes`.
///
/// Returns `None` (and logs why) when the file must be skipped.
pub(crate) async fn load_attachment(path: &Path, max_bytes: u64) -> Option<(String, Vec<u8>)> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) if m.is_file() => m,
        Ok(_) | Err(_) => {
            warn!(path = %path.display(), "Attachment not found, sending without it");
            return None;
        }
    };

    if metadata.len() > max_bytes {
        warn!(
            path = %path.display(),
            size = metadata.len(),
            limit = max_bytes,
            "Attachment too large, sending without it"
        );
        return None;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("attachment")
        .to_string();

    match tokio::fs::read(path).await {
        Ok(bytes) => Some((file_name, bytes)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read attachment, sending without it");
            None
        }
    }
}

/// A notification sink.
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    /// Provider type name.
    fn kind(&self) -> &'static str;

    /// Instance name, unique within a dispatcher.
    fn name(&self) -> &str;

    /// Whether attachments are uploaded. Others silently drop them.
    fn supports_attachments(&self) -> bool {
        false
    }

    /// Deliver one event. A single attempt.
    async fn send(&self, event: &NotificationEvent) -> std::result::Result<(), DeliveryError>;

    /// Send a minimal synthetic event to check reachability.
    async fn test_connection(&self, app_name: &str) -> std::result::Result<(), DeliveryError> {
        self.send(&NotificationEvent::connection_test(app_name)).await
    }
}

fn default_enabled() -> bool {
    true
}

fn default_rate_limit_interval_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    30
}

/// Settings shared by every provider kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Display name; defaults to the provider kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Minimum level delivered by this provider.
    #[serde(default)]
    pub min_level: NotificationLevel,
    /// Minimum time between two sends, in milliseconds.
    #[serde(default = "default_rate_limit_interval_ms")]
    pub rate_limit_interval_ms: u64,
    /// Delivery attempts per event.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: None,
            enabled: default_enabled(),
            min_level: NotificationLevel::default(),
            rate_limit_interval_ms: default_rate_limit_interval_ms(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ProviderSettings {
    pub fn rate_limit_interval(&self) -> Duration {
        Duration::from_millis(self.rate_limit_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Provider configuration, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Discord webhook.
    Discord(DiscordConfig),
    /// Generic HTTP webhook.
    Webhook(WebhookConfig),
}

impl ProviderConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Discord(_) => "discord",
            Self::Webhook(_) => "webhook",
        }
    }

    pub fn settings(&self) -> &ProviderSettings {
        match self {
            Self::Discord(c) => &c.settings,
            Self::Webhook(c) => &c.settings,
        }
    }

    pub fn settings_mut(&mut self) -> &mut ProviderSettings {
        match self {
            Self::Discord(c) => &mut c.settings,
            Self::Webhook(c) => &mut c.settings,
        }
    }

    pub fn name(&self) -> &str {
        self.settings().name.as_deref().unwrap_or(self.kind())
    }

    pub fn is_enabled(&self) -> bool {
        self.settings().enabled
    }

    /// Check required fields. Disabled providers are validated too.
    pub fn validate(&self) -> Result<()> {
        let settings = self.settings();
        if settings.max_retries == 0 {
            return Err(Error::config(format!(
                "provider '{}': max_retries must be >= 1",
                self.name()
            )));
        }
        if settings.timeout_secs == 0 {
            return Err(Error::config(format!(
                "provider '{}': timeout_secs must be >= 1",
                self.name()
            )));
        }
        match self {
            Self::Discord(c) => c.validate(self.name()),
            Self::Webhook(c) => c.validate(self.name()),
        }
    }

    /// Instantiate the provider.
    pub fn build(&self, app_name: &str) -> Arc<dyn NotificationProvider> {
        let name = self.name().to_string();
        match self {
            Self::Discord(c) => Arc::new(DiscordProvider::new(name, c.clone(), app_name)),
            Self::Webhook(c) => Arc::new(WebhookProvider::new(name, c.clone())),
        }
    }
}

/// Ensure `raw` is an absolute http(s) URL.
pub(crate) fn validate_http_url(provider: &str, field: &str, raw: &str) -> Result<url::Url> {
    if raw.trim().is_empty() {
        return Err(Error::config(format!(
            "provider '{provider}': {field} is required"
        )));
    }
    let parsed = url::Url::parse(raw.trim()).map_err(|e| {
        Error::config(format!("provider '{provider}': invalid {field} '{raw}': {e}"))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(Error::config(format!(
            "provider '{provider}': {field} must use http or https, got '{scheme}'"
        ))),
    }
}
