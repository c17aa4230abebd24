//! Notification delivery.
//!
//! Events describing punch results and scheduler lifecycle are fanned out to
//! every configured provider by the [`NotificationDispatcher`].

pub mod channels;
mod dispatcher;
mod events;
mod rate_limiter;

pub use channels::{
    DeliveryError, DiscordConfig, NotificationProvider, ProviderConfig, ProviderSettings,
    WebhookConfig,
};
pub use dispatcher::{
    DeliveryReport, DeliveryStatus, NotificationConfig, NotificationDispatcher, PublishReport,
    SkipReason,
};
pub use events::{EventKind, NotificationEvent, NotificationLevel, SchedulerEventKind};
pub use rate_limiter::{RateLimiter, RateLimiterState};
