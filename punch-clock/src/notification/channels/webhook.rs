//! Generic webhook provider.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{
    DeliveryError, NotificationProvider, ProviderSettings, parse_retry_after, validate_http_url,
};
use crate::notification::events::NotificationEvent;
use crate::{Error, Result};

fn default_method() -> String {
    "POST".to_string()
}

/// Webhook provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(flatten)]
    pub settings: ProviderSettings,
    /// Webhook URL.
    pub url: String,
    /// HTTP method, `POST` or `PUT`.
    #[serde(default = "default_method")]
    pub method: String,
    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<WebhookAuth>,
}

/// Webhook authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WebhookAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            settings: ProviderSettings::default(),
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            auth: None,
        }
    }

    pub(super) fn validate(&self, name: &str) -> Result<()> {
        validate_http_url(name, "url", &self.url)?;
        if !matches!(self.method.to_uppercase().as_str(), "POST" | "PUT") {
            return Err(Error::config(format!(
                "provider '{name}': unsupported method '{}'",
                self.method
            )));
        }
        for (header, value) in &self.headers {
            header
                .parse::<reqwest::header::HeaderName>()
                .map_err(|e| Error::config(format!("provider '{name}': header '{header}': {e}")))?;
            value
                .parse::<reqwest::header::HeaderValue>()
                .map_err(|e| Error::config(format!("provider '{name}': header '{header}': {e}")))?;
        }
        Ok(())
    }
}

/// Generic webhook notification provider.
pub struct WebhookProvider {
    name: String,
    config: WebhookConfig,
    client: Client,
}

impl WebhookProvider {
    pub fn new(name: impl Into<String>, config: WebhookConfig) -> Self {
        crate::utils::http_client::install_rustls_provider();
        let client = crate::utils::http_client::build_client(config.settings.timeout());
        Self {
            name: name.into(),
            config,
            client,
        }
    }

    /// Build the request headers.
    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }
        headers
    }

    /// Build the JSON payload.
    fn build_payload(&self, event: &NotificationEvent) -> serde_json::Value {
        let fields: Vec<_> = event
            .fields
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        json!({
            "event_type": event.event_type(),
            "level": event.level.as_str(),
            "title": event.title,
            "description": event.description,
            "fields": fields,
            "timestamp": event.timestamp.to_rfc3339(),
        })
    }
}

#[async_trait]
impl NotificationProvider for WebhookProvider {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &NotificationEvent) -> std::result::Result<(), DeliveryError> {
        let mut request = match self.config.method.to_uppercase().as_str() {
            "PUT" => self.client.put(&self.config.url),
            _ => self.client.post(&self.config.url),
        };

        request = request
            .headers(self.build_headers())
            .json(&self.build_payload(event));

        request = match &self.config.auth {
            Some(WebhookAuth::Bearer { token }) => request.bearer_auth(token),
            Some(WebhookAuth::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            debug!(provider = %self.name, event = event.event_type(), "Webhook notification sent");
            return Ok(());
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let error = DeliveryError::from_status(status, &body, retry_after);
        warn!(provider = %self.name, status = %status, error = %error.message, "Webhook failed");
        Err(error)
    }
}
