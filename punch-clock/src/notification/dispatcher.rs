//! Notification fan-out.
//!
//! The dispatcher owns every configured provider and delivers each published
//! event to all enabled, level-matching providers concurrently. Every provider
//! has its own rate limiter and its own circuit breaker (`provider:<name>`),
//! so one broken sink never delays or blocks another.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channels::{NotificationProvider, ProviderConfig, ProviderSettings};
use super::events::{NotificationEvent, NotificationLevel};
use super::rate_limiter::RateLimiter;
use crate::action::{ActionOutcome, ErrorKind};
use crate::resilience::{
    BackoffPolicy, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, RetryExecutor,
    RetryPolicy,
};
use crate::{Error, Result};

fn default_publish_timeout_secs() -> u64 {
    60
}

fn default_app_name() -> String {
    "Punch Clock".to_string()
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    60
}

/// Configuration for the notification dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Upper bound on a single publish call, per provider.
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    /// Name shown in message footers.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Consecutive failures that open a provider's circuit.
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub circuit_breaker_cooldown_secs: u64,
    /// Backoff between delivery attempts.
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            publish_timeout_secs: default_publish_timeout_secs(),
            app_name: default_app_name(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_cooldown_secs: default_breaker_cooldown_secs(),
            backoff: BackoffPolicy::default(),
            providers: Vec::new(),
        }
    }
}

impl NotificationConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(
            self.circuit_breaker_threshold,
            Duration::from_secs(self.circuit_breaker_cooldown_secs),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.publish_timeout_secs == 0 {
            return Err(Error::config("notifications.publish_timeout_secs must be >= 1"));
        }
        self.breaker_config().validate()?;
        self.backoff.validate()?;

        let mut names = std::collections::HashSet::new();
        for provider in &self.providers {
            provider.validate()?;
            if !names.insert(provider.name().to_string()) {
                return Err(Error::config(format!(
                    "duplicate notification provider name '{}'",
                    provider.name()
                )));
            }
        }
        Ok(())
    }
}

/// Why a provider did not receive an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    BelowMinLevel {
        level: NotificationLevel,
        min_level: NotificationLevel,
    },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("provider disabled"),
            Self::BelowMinLevel { level, min_level } => {
                write!(f, "level {level} below minimum {min_level}")
            }
        }
    }
}

/// Result of delivering one event to one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered {
        attempts: u32,
    },
    Skipped(SkipReason),
    Failed {
        kind: ErrorKind,
        message: String,
        attempts: u32,
    },
    TimedOut,
}

/// Per-provider entry of a publish result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub provider: String,
    pub kind: &'static str,
    pub status: DeliveryStatus,
}

impl DeliveryReport {
    pub fn is_delivered(&self) -> bool {
        matches!(self.status, DeliveryStatus::Delivered { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, DeliveryStatus::Skipped(_))
    }

    /// The delivery failure as an error, if the provider failed or timed out.
    pub fn error(&self) -> Option<Error> {
        match &self.status {
            DeliveryStatus::Failed { message, .. } => {
                Some(Error::provider(self.provider.clone(), message.clone()))
            }
            DeliveryStatus::TimedOut => Some(Error::provider(
                self.provider.clone(),
                "timed out waiting for delivery",
            )),
            _ => None,
        }
    }
}

/// Aggregate result of a publish call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub results: Vec<DeliveryReport>,
}

impl PublishReport {
    pub fn delivered(&self) -> usize {
        self.results.iter().filter(|r| r.is_delivered()).count()
    }

    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| r.is_skipped()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.delivered() - self.skipped()
    }

    /// Every provider that was supposed to receive the event did.
    pub fn all_delivered(&self) -> bool {
        self.failed() == 0
    }

    pub fn get(&self, provider: &str) -> Option<&DeliveryReport> {
        self.results.iter().find(|r| r.provider == provider)
    }

    /// One-line count, e.g. `2/3 delivered (1 skipped)`.
    pub fn summary(&self) -> String {
        let targeted = self.results.len() - self.skipped();
        match self.skipped() {
            0 => format!("{}/{targeted} delivered", self.delivered()),
            skipped => format!("{}/{targeted} delivered ({skipped} skipped)", self.delivered()),
        }
    }
}

/// A provider together with its delivery guards.
struct ManagedProvider {
    /// Circuit breaker key.
    key: String,
    settings: ProviderSettings,
    provider: Arc<dyn NotificationProvider>,
    limiter: RateLimiter,
    policy: RetryPolicy,
}

impl ManagedProvider {
    fn report(&self, status: DeliveryStatus) -> DeliveryReport {
        DeliveryReport {
            provider: self.provider.name().to_string(),
            kind: self.provider.kind(),
            status,
        }
    }

    fn skip_reason(&self, level: NotificationLevel) -> Option<SkipReason> {
        if !self.settings.enabled {
            Some(SkipReason::Disabled)
        } else if level < self.settings.min_level {
            Some(SkipReason::BelowMinLevel {
                level,
                min_level: self.settings.min_level,
            })
        } else {
            None
        }
    }

    /// Rate-limited, retried delivery of `event`, or a connection test when
    /// `connection_test` carries the app name.
    async fn deliver(
        &self,
        executor: &RetryExecutor,
        event: &NotificationEvent,
        connection_test: Option<&str>,
    ) -> DeliveryStatus {
        if event.attachment.is_some() && !self.provider.supports_attachments() {
            debug!(provider = %self.key, "Provider does not support attachments, omitting");
        }

        let report = executor
            .run(&self.key, &self.policy, move || async move {
                self.limiter.acquire().await;
                let result = match connection_test {
                    Some(app_name) => self.provider.test_connection(app_name).await,
                    None => self.provider.send(event).await,
                };
                match result {
                    Ok(()) => ActionOutcome::success("delivered"),
                    Err(e) => {
                        if let Some(retry_after) = e.retry_after {
                            self.limiter.defer(retry_after).await;
                        }
                        ActionOutcome::failure(e.kind, e.message)
                    }
                }
            })
            .await;

        match report.outcome {
            ActionOutcome::Success(_) => DeliveryStatus::Delivered {
                attempts: report.attempts,
            },
            ActionOutcome::Failure { kind, message } => DeliveryStatus::Failed {
                kind,
                message,
                attempts: report.attempts,
            },
        }
    }
}

/// Fans notification events out to every configured provider.
pub struct NotificationDispatcher {
    providers: Vec<Arc<ManagedProvider>>,
    executor: RetryExecutor,
    backoff: BackoffPolicy,
    publish_timeout: Duration,
    app_name: String,
}

impl NotificationDispatcher {
    /// Dispatcher without providers.
    pub fn empty(app_name: impl Into<String>, publish_timeout: Duration) -> Self {
        Self::with_breakers(
            app_name,
            publish_timeout,
            Arc::new(CircuitBreakerRegistry::new(
                NotificationConfig::default().breaker_config(),
            )),
        )
    }

    fn with_breakers(
        app_name: impl Into<String>,
        publish_timeout: Duration,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            providers: Vec::new(),
            executor: RetryExecutor::new(breakers),
            backoff: BackoffPolicy::default(),
            publish_timeout,
            app_name: app_name.into(),
        }
    }

    /// Validate `config` and instantiate every provider it lists.
    pub fn from_config(config: &NotificationConfig) -> Result<Self> {
        config.validate()?;

        let mut dispatcher = Self::with_breakers(
            config.app_name.clone(),
            config.publish_timeout(),
            Arc::new(CircuitBreakerRegistry::new(config.breaker_config())),
        )
        .with_backoff(config.backoff.clone());

        for provider_config in &config.providers {
            dispatcher.add_provider(
                provider_config.settings().clone(),
                provider_config.build(&config.app_name),
            )?;
            info!(
                provider = %provider_config.name(),
                kind = provider_config.kind(),
                enabled = provider_config.is_enabled(),
                "Initialized notification provider"
            );
        }

        info!(
            providers = dispatcher.providers.len(),
            "Notification dispatcher initialized"
        );
        Ok(dispatcher)
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Stop waiting between delivery attempts once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.executor = self.executor.with_cancellation(token);
        self
    }

    /// Register a provider. Names must be unique.
    pub fn add_provider(
        &mut self,
        settings: ProviderSettings,
        provider: Arc<dyn NotificationProvider>,
    ) -> Result<()> {
        if self
            .providers
            .iter()
            .any(|p| p.provider.name() == provider.name())
        {
            return Err(Error::config(format!(
                "duplicate notification provider name '{}'",
                provider.name()
            )));
        }

        let policy = RetryPolicy::new(settings.max_retries.max(1), self.backoff.clone());
        self.providers.push(Arc::new(ManagedProvider {
            key: format!("provider:{}", provider.name()),
            limiter: RateLimiter::new(settings.rate_limit_interval()),
            settings,
            provider,
            policy,
        }));
        Ok(())
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.provider.name()).collect()
    }

    pub fn enabled_count(&self) -> usize {
        self.providers.iter().filter(|p| p.settings.enabled).count()
    }

    /// Circuit state of every provider that has been used.
    pub fn breaker_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.executor.breakers().snapshots()
    }

    /// Deliver `event` to every enabled provider whose minimum level it meets.
    ///
    /// Never fails: provider errors and timeouts are recorded in the report.
    pub async fn publish(&self, event: NotificationEvent) -> PublishReport {
        self.fan_out(Arc::new(event), true, None).await
    }

    /// Send a synthetic event to every enabled provider, ignoring level filters.
    pub async fn test_connections(&self) -> PublishReport {
        let event = Arc::new(NotificationEvent::connection_test(&self.app_name));
        let app_name = Some(self.app_name.clone());
        self.fan_out(event, false, app_name).await
    }

    async fn fan_out(
        &self,
        event: Arc<NotificationEvent>,
        filter_level: bool,
        connection_test: Option<String>,
    ) -> PublishReport {
        let mut results: Vec<Option<DeliveryReport>> = vec![None; self.providers.len()];
        let mut pending = Vec::new();

        for (idx, managed) in self.providers.iter().enumerate() {
            let skip = match managed.skip_reason(event.level) {
                Some(SkipReason::BelowMinLevel { .. }) if !filter_level => None,
                other => other,
            };
            if let Some(reason) = skip {
                debug!(provider = %managed.key, reason = %reason, "Skipping provider");
                results[idx] = Some(managed.report(DeliveryStatus::Skipped(reason)));
                continue;
            }

            let managed = managed.clone();
            let event = event.clone();
            let executor = self.executor.clone();
            let timeout = self.publish_timeout;
            let connection_test = connection_test.clone();

            let handle = tokio::spawn(async move {
                let delivery = managed.deliver(&executor, &event, connection_test.as_deref());
                match tokio::time::timeout(timeout, delivery).await {
                    Ok(status) => status,
                    Err(_) => {
                        warn!(provider = %managed.key, timeout = ?timeout, "Notification delivery timed out");
                        DeliveryStatus::TimedOut
                    }
                }
            });
            pending.push((idx, handle));
        }

        let joined = join_all(
            pending
                .into_iter()
                .map(|(idx, handle)| async move { (idx, handle.await) }),
        )
        .await;

        for (idx, result) in joined {
            let status = result.unwrap_or_else(|e| DeliveryStatus::Failed {
                kind: ErrorKind::Unknown,
                message: format!("delivery task failed: {e}"),
                attempts: 0,
            });
            if let DeliveryStatus::Failed { kind, message, .. } = &status {
                warn!(
                    provider = %self.providers[idx].key,
                    kind = %kind,
                    error = %message,
                    "Notification delivery failed"
                );
            }
            results[idx] = Some(self.providers[idx].report(status));
        }

        let report = PublishReport {
            results: results.into_iter().flatten().collect(),
        };

        info!(
            event = event.event_type(),
            level = %event.level,
            failed = report.failed(),
            summary = %report.summary(),
            "Notification published"
        );

        report
    }
}
