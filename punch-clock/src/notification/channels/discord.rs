//! Discord webhook provider.
//!
//! Each event becomes a single embed. Attachments are uploaded as multipart
//! `files[0]` next to a `payload_json` part; images are also referenced from
//! the embed so Discord renders them inline.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{
    DeliveryError, NotificationProvider, ProviderSettings, load_attachment, parse_retry_after,
    validate_http_url,
};
use crate::Result;
use crate::notification::events::NotificationEvent;

/// Largest file Discord accepts from a webhook without boosts.
pub const DISCORD_MAX_ATTACHMENT_BYTES: u64 = 8 * 1024 * 1024;

const DISCORD_HOSTS: [&str; 3] = ["discord.com", "discordapp.com", "ptb.discord.com"];

// Discord embed limits.
const MAX_TITLE_CHARS: usize = 256;
const MAX_DESCRIPTION_CHARS: usize = 4096;
const MAX_FIELDS: usize = 25;
const MAX_FIELD_NAME_CHARS: usize = 256;
const MAX_FIELD_VALUE_CHARS: usize = 1024;

/// Discord provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(flatten)]
    pub settings: ProviderSettings,
    /// Discord webhook URL.
    pub webhook_url: String,
    /// Optional username override for the webhook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional avatar URL override for the webhook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl DiscordConfig {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            settings: ProviderSettings::default(),
            webhook_url: webhook_url.into(),
            username: None,
            avatar_url: None,
        }
    }

    pub(super) fn validate(&self, name: &str) -> Result<()> {
        let url = validate_http_url(name, "webhook_url", &self.webhook_url)?;
        let host = url.host_str().unwrap_or_default();
        if !DISCORD_HOSTS.contains(&host) || !url.path().starts_with("/api/webhooks/") {
            warn!(
                provider = %name,
                url = %url,
                "Discord webhook URL does not look like https://discord.com/api/webhooks/..."
            );
        }
        Ok(())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}

fn is_image(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    [".png", ".jpg", ".jpeg", ".gif", ".webp"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

/// Discord notification provider.
pub struct DiscordProvider {
    name: String,
    config: DiscordConfig,
    app_name: String,
    client: Client,
}

impl DiscordProvider {
    pub fn new(name: impl Into<String>, config: DiscordConfig, app_name: &str) -> Self {
        crate::utils::http_client::install_rustls_provider();
        let client = crate::utils::http_client::build_client(config.settings.timeout());
        Self {
            name: name.into(),
            config,
            app_name: app_name.to_string(),
            client,
        }
    }

    /// Build the webhook payload for an event.
    fn build_payload(&self, event: &NotificationEvent, image: Option<&str>) -> serde_json::Value {
        let fields: Vec<_> = event
            .fields
            .iter()
            .take(MAX_FIELDS)
            .map(|(name, value)| {
                json!({
                    "name": truncate(name, MAX_FIELD_NAME_CHARS),
                    "value": truncate(if value.is_empty() { "-" } else { value.as_str() }, MAX_FIELD_VALUE_CHARS),
                    "inline": true,
                })
            })
            .collect();

        let mut embed = json!({
            "title": truncate(&event.title, MAX_TITLE_CHARS),
            "description": truncate(&event.description, MAX_DESCRIPTION_CHARS),
            "color": event.level.color(),
            "timestamp": event.timestamp.to_rfc3339(),
            "fields": fields,
            "footer": {
                "text": format!("{} • {}", self.app_name, event.level.as_str().to_uppercase())
            }
        });

        if let Some(file_name) = image {
            embed["image"] = json!({ "url": format!("attachment://{file_name}") });
        }

        let mut payload = json!({ "embeds": [embed] });

        if let Some(username) = &self.config.username {
            payload["username"] = json!(username);
        }
        if let Some(avatar_url) = &self.config.avatar_url {
            payload["avatar_url"] = json!(avatar_url);
        }

        payload
    }
}

#[async_trait]
impl NotificationProvider for DiscordProvider {
    fn kind(&self) -> &'static str {
        "discord"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports_attachments(&self) -> bool {
        true
    }

    async fn send(&self, event: &NotificationEvent) -> std::result::Result<(), DeliveryError> {
        let attachment = match &event.attachment {
            Some(path) => load_attachment(path, DISCORD_MAX_ATTACHMENT_BYTES).await,
            None => None,
        };

        let request = self.client.post(&self.config.webhook_url);
        let request = match attachment {
            Some((file_name, bytes)) => {
                let image = is_image(&file_name).then_some(file_name.as_str());
                let payload = self.build_payload(event, image);
                let part = Part::bytes(bytes).file_name(file_name.clone());
                let form = Form::new()
                    .text("payload_json", payload.to_string())
                    .part("files[0]", part);
                request.multipart(form)
            }
            None => request.json(&self.build_payload(event, None)),
        };

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            debug!(provider = %self.name, event = event.event_type(), "Discord notification sent");
            return Ok(());
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let error = DeliveryError::from_status(status, &body, retry_after);
        warn!(provider = %self.name, status = %status, error = %error.message, "Discord webhook failed");
        Err(error)
    }
}
