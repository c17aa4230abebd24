//! Application configuration.
//!
//! Configuration is read from a TOML file and then overridden by a small set
//! of environment variables. Everything is validated once at startup; a
//! configuration that passes [`AppConfig::validate`] can be turned into
//! scheduler jobs, actions and a notification dispatcher without further
//! checks failing at runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::action::{Action, CommandAction, PunchKind};
use crate::logging::DEFAULT_LOG_RETENTION_DAYS;
use crate::notification::{
    DiscordConfig, NotificationConfig, NotificationDispatcher, ProviderConfig,
};
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, RetryPolicy};
use crate::scheduler::{Job, SchedulerConfig, TimeOfDay, Trigger};
use crate::{Error, Result};

/// Config file used when neither `--config` nor the env var is set.
pub const DEFAULT_CONFIG_PATH: &str = "punch-clock.toml";

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "PUNCH_CLOCK_CONFIG";

/// Environment overrides.
pub const ENV_CLOCK_IN_TIME: &str = "CLOCK_IN_TIME";
pub const ENV_CLOCK_OUT_TIME: &str = "CLOCK_OUT_TIME";
pub const ENV_SCHEDULE_ENABLED: &str = "SCHEDULE_ENABLED";
pub const ENV_WEEKDAYS_ONLY: &str = "WEEKDAYS_ONLY";
pub const ENV_TIMEZONE: &str = "TIMEZONE";
pub const ENV_DISCORD_WEBHOOK_URL: &str = "DISCORD_WEBHOOK_URL";

fn default_timezone() -> String {
    "Asia/Taipei".to_string()
}

fn default_true() -> bool {
    true
}

fn default_status_interval_secs() -> u64 {
    300
}

fn default_misfire_grace_secs() -> u64 {
    30
}

fn default_action_args() -> Vec<String> {
    vec!["{action}".to_string()]
}

fn default_action_timeout_secs() -> u64 {
    300
}

fn default_terminal_exit_codes() -> Vec<i32> {
    vec![2]
}

fn default_retention_days() -> u32 {
    DEFAULT_LOG_RETENTION_DAYS
}

/// `[schedule]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Clock-in time, `HH:MM`.
    #[serde(default)]
    pub clock_in: Option<String>,
    /// Clock-out time, `HH:MM`.
    #[serde(default)]
    pub clock_out: Option<String>,
    /// When false both jobs are registered but never fire.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub weekdays_only: bool,
    /// Seconds between status log lines, 0 to disable.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    /// Lateness after which a fire is skipped.
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            clock_in: None,
            clock_out: None,
            enabled: true,
            weekdays_only: true,
            status_interval_secs: default_status_interval_secs(),
            misfire_grace_secs: default_misfire_grace_secs(),
        }
    }
}

/// `[action]` section: the external program performing a punch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    /// Arguments; `{action}` becomes `clock_in` or `clock_out`.
    #[serde(default = "default_action_args")]
    pub args: Vec<String>,
    #[serde(default = "default_action_timeout_secs")]
    pub timeout_secs: u64,
    /// Exit codes meaning "retrying cannot help".
    #[serde(default = "default_terminal_exit_codes")]
    pub terminal_exit_codes: Vec<i32>,
    /// File attached to the result notification, `{action}` substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_path: Option<String>,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: default_action_args(),
            timeout_secs: default_action_timeout_secs(),
            terminal_exit_codes: default_terminal_exit_codes(),
            attachment_path: None,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Directory for rolling log files; console only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Filter directive, e.g. `punch_clock=debug`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: None,
            retention_days: default_retention_days(),
            filter: None,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// IANA timezone triggers are evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub action: ActionConfig,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            schedule: ScheduleConfig::default(),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            notifications: NotificationConfig::default(),
            action: ActionConfig::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Parse a boolean environment value.
pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(Error::config(format!(
            "{key}: expected a boolean (true/false, 1/0, yes/no, on/off), got '{other}'"
        ))),
    }
}

fn parse_time(field: &str, value: Option<&str>, env_key: &str) -> Result<TimeOfDay> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            Error::config(format!(
                "{field} is required (set it in the config file or {env_key})"
            ))
        })?;
    value
        .parse()
        .map_err(|_| Error::config(format!("{field}: invalid time '{value}', expected HH:MM")))
}

impl AppConfig {
    /// Resolve the config path: explicit path, then `PUNCH_CLOCK_CONFIG`, then
    /// `punch-clock.toml` if it exists.
    pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV)
            && !path.trim().is_empty()
        {
            return Some(PathBuf::from(path));
        }
        let default = PathBuf::from(DEFAULT_CONFIG_PATH);
        default.is_file().then_some(default)
    }

    /// Load, apply environment overrides and validate.
    ///
    /// Without a config file the configuration comes from the environment alone.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match Self::resolve_path(explicit) {
            Some(path) => Self::from_file(&path)?,
            None => {
                debug!("No config file found, using defaults and environment");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        let config = Self::from_toml(&content)?;
        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply the supported environment overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = get(ENV_CLOCK_IN_TIME) {
            self.schedule.clock_in = Some(value);
        }
        if let Some(value) = get(ENV_CLOCK_OUT_TIME) {
            self.schedule.clock_out = Some(value);
        }
        if let Some(value) = get(ENV_SCHEDULE_ENABLED) {
            self.schedule.enabled = parse_bool(ENV_SCHEDULE_ENABLED, &value)?;
        }
        if let Some(value) = get(ENV_WEEKDAYS_ONLY) {
            self.schedule.weekdays_only = parse_bool(ENV_WEEKDAYS_ONLY, &value)?;
        }
        if let Some(value) = get(ENV_TIMEZONE) {
            self.timezone = value.trim().to_string();
        }
        if let Some(url) = get(ENV_DISCORD_WEBHOOK_URL) {
            let url = url.trim().to_string();
            let existing = self
                .notifications
                .providers
                .iter_mut()
                .find_map(|p| match p {
                    ProviderConfig::Discord(c) => Some(c),
                    _ => None,
                });
            match existing {
                Some(discord) => discord.webhook_url = url,
                None => self
                    .notifications
                    .providers
                    .push(ProviderConfig::Discord(DiscordConfig::new(url))),
            }
        }
        Ok(())
    }

    /// Check every value. Fails with [`Error::Configuration`].
    pub fn validate(&self) -> Result<()> {
        self.tz()?;
        self.clock_in()?;
        self.clock_out()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.notifications.validate()?;

        if let Some(program) = &self.action.program
            && program.trim().is_empty()
        {
            return Err(Error::config("action.program must not be empty"));
        }
        if self.action.timeout_secs == 0 {
            return Err(Error::config("action.timeout_secs must be >= 1"));
        }
        if let Some(filter) = &self.logging.filter {
            crate::logging::build_filter(Some(filter))?;
        }
        Ok(())
    }

    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .trim()
            .parse::<Tz>()
            .map_err(|_| Error::config(format!("unknown timezone '{}'", self.timezone)))
    }

    pub fn clock_in(&self) -> Result<TimeOfDay> {
        parse_time(
            "schedule.clock_in",
            self.schedule.clock_in.as_deref(),
            ENV_CLOCK_IN_TIME,
        )
    }

    pub fn clock_out(&self) -> Result<TimeOfDay> {
        parse_time(
            "schedule.clock_out",
            self.schedule.clock_out.as_deref(),
            ENV_CLOCK_OUT_TIME,
        )
    }

    pub fn trigger(&self, kind: PunchKind) -> Result<Trigger> {
        let time = match kind {
            PunchKind::ClockIn => self.clock_in()?,
            PunchKind::ClockOut => self.clock_out()?,
        };
        Ok(Trigger {
            time,
            weekdays_only: self.schedule.weekdays_only,
        })
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        let status_interval = match self.schedule.status_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Ok(SchedulerConfig {
            timezone: self.tz()?,
            retry: self.retry.clone(),
            misfire_grace: Duration::from_secs(self.schedule.misfire_grace_secs),
            status_interval,
        })
    }

    /// Breaker registry for punch operations.
    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::new(CircuitBreakerRegistry::new(self.circuit_breaker.clone()))
    }

    /// The external command performing `kind`.
    pub fn build_action(&self, kind: PunchKind) -> Result<Arc<dyn Action>> {
        let program = self
            .action
            .program
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::config("action.program is required to run punches"))?;

        Ok(Arc::new(
            CommandAction::new(kind, program)
                .with_args(self.action.args.clone())
                .with_timeout(Duration::from_secs(self.action.timeout_secs))
                .with_terminal_exit_codes(self.action.terminal_exit_codes.clone())
                .with_attachment_path(self.action.attachment_path.clone()),
        ))
    }

    /// The clock-in and clock-out jobs.
    pub fn build_jobs(&self) -> Result<Vec<Job>> {
        PunchKind::ALL
            .iter()
            .map(|&kind| {
                Ok(
                    Job::punch(kind, self.trigger(kind)?, self.build_action(kind)?)
                        .with_enabled(self.schedule.enabled),
                )
            })
            .collect()
    }

    pub fn build_dispatcher(&self) -> Result<NotificationDispatcher> {
        NotificationDispatcher::from_config(&self.notifications)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;
    use crate::notification::NotificationLevel;

    const FULL: &str = r#"
        timezone = "Europe/Berlin"

        [schedule]
        clock_in = "08:30"
        clock_out = "17:45"
        weekdays_only = false
        status_interval_secs = 0

        [retry]
        max_attempts = 5
        base_delay_ms = 500

        [circuit_breaker]
        failure_threshold = 2
        cooldown_secs = 60

        [action]
        program = "/usr/local/bin/punch"
        args = ["--mode", "{action}"]
        attachment_path = "/tmp/{action}.png"

        [notifications]
        app_name = "HR Bot"

        [[notifications.providers]]
        type = "discord"
        webhook_url = "https://discord.com/api/webhooks/1/abc"

        [[notifications.providers]]
        type = "webhook"
        name = "ops"
        url = "https://hooks.example.com/punch"
        min_level = "error"
    "#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_full_config() {
        let config = AppConfig::from_toml(FULL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.tz().unwrap(), chrono_tz::Europe::Berlin);
        assert_eq!(config.clock_in().unwrap().to_string(), "08:30");
        assert!(!config.trigger(PunchKind::ClockOut).unwrap().weekdays_only);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff.base_delay_ms, 500);
        assert_eq!(config.retry.backoff.max_delay_ms, 30_000);
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.notifications.providers.len(), 2);
        assert_eq!(
            config.notifications.providers[1].settings().min_level,
            NotificationLevel::Error
        );
        assert_eq!(config.scheduler_config().unwrap().status_interval, None);

        let jobs = config.build_jobs().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, "clock_in_job");
        assert_eq!(jobs[1].id, "clock_out_job");
        assert_eq!(jobs[0].operation, jobs[1].operation);

        let dispatcher = config.build_dispatcher().unwrap();
        assert_eq!(dispatcher.provider_names(), vec!["discord", "ops"]);
        assert_eq!(dispatcher.app_name(), "HR Bot");
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [schedule]
            clock_in = "09:00"
            clock_out = "18:00"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.tz().unwrap(), chrono_tz::Asia::Taipei);
        assert!(config.schedule.enabled);
        assert!(config.schedule.weekdays_only);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.cooldown_secs, 300);
        assert_eq!(config.notifications.publish_timeout_secs, 60);
        assert_eq!(config.logging.retention_days, 7);
        assert_eq!(config.action.terminal_exit_codes, vec![2]);
        assert_eq!(
            config.scheduler_config().unwrap().status_interval,
            Some(Duration::from_secs(300))
        );
        assert!(matches!(
            config.build_jobs(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_times_are_config_errors() {
        let config = AppConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(ref m) if m.contains("clock_in")));
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let cases = [
            r#"[schedule]
               clock_in = "25:00"
               clock_out = "18:00""#,
            r#"timezone = "Mars/Olympus"
               [schedule]
               clock_in = "09:00"
               clock_out = "18:00""#,
            r#"[schedule]
               clock_in = "09:00"
               clock_out = "18:00"
               [retry]
               max_attempts = 0"#,
            r#"[schedule]
               clock_in = "09:00"
               clock_out = "18:00"
               [circuit_breaker]
               failure_threshold = 0"#,
            r#"[schedule]
               clock_in = "09:00"
               clock_out = "18:00"
               [[notifications.providers]]
               type = "discord"
               webhook_url = """#,
            r#"[schedule]
               clock_in = "09:00"
               clock_out = "18:00"
               [[notifications.providers]]
               type = "webhook"
               url = "https://a.example.com"
               [[notifications.providers]]
               type = "webhook"
               url = "https://b.example.com""#,
        ];

        for case in cases {
            let config = AppConfig::from_toml(case).unwrap();
            assert!(
                matches!(config.validate(), Err(Error::Configuration(_))),
                "expected config error for:\n{case}"
            );
        }
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::from_toml(FULL).unwrap();
        config
            .apply_env_overrides(env(&[
                (ENV_CLOCK_IN_TIME, "07:15"),
                (ENV_SCHEDULE_ENABLED, "off"),
                (ENV_WEEKDAYS_ONLY, "YES"),
                (ENV_TIMEZONE, "Asia/Tokyo"),
                (ENV_DISCORD_WEBHOOK_URL, "https://discord.com/api/webhooks/2/xyz"),
            ]))
            .unwrap();
        config.validate().unwrap();

        assert_eq!(config.clock_in().unwrap().to_string(), "07:15");
        assert_eq!(config.clock_out().unwrap().to_string(), "17:45");
        assert!(!config.schedule.enabled);
        assert!(config.schedule.weekdays_only);
        assert_eq!(config.tz().unwrap(), chrono_tz::Asia::Tokyo);
        match &config.notifications.providers[0] {
            ProviderConfig::Discord(c) => {
                assert_eq!(c.webhook_url, "https://discord.com/api/webhooks/2/xyz")
            }
            other => panic!("unexpected provider {other:?}"),
        }
        assert!(config.build_jobs().unwrap().iter().all(|j| !j.enabled));
    }

    #[test]
    fn test_env_only_configuration() {
        let mut config = AppConfig::default();
        config
            .apply_env_overrides(env(&[
                (ENV_CLOCK_IN_TIME, "09:00"),
                (ENV_CLOCK_OUT_TIME, "18:00"),
                (ENV_DISCORD_WEBHOOK_URL, "https://discord.com/api/webhooks/1/abc"),
            ]))
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config.notifications.providers.len(), 1);
        assert_eq!(config.notifications.providers[0].kind(), "discord");
    }

    #[test]
    fn test_invalid_bool_override() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env_overrides(env(&[(ENV_WEEKDAYS_ONLY, "maybe")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(ref m) if m.contains(ENV_WEEKDAYS_ONLY)));
    }

    #[test]
    fn test_parse_bool() {
        for value in ["true", "1", "yes", "ON", " True "] {
            assert!(parse_bool("X", value).unwrap());
        }
        for value in ["false", "0", "no", "OFF"] {
            assert!(!parse_bool("X", value).unwrap());
        }
        assert!(parse_bool("X", "2").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.notifications.app_name, "HR Bot");

        let missing = file.path().with_extension("missing");
        assert!(matches!(
            AppConfig::from_file(&missing),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = AppConfig::from_toml(include_str!("../../punch-clock.example.toml")).unwrap();
        config.validate().unwrap();

        assert_eq!(config.clock_out().unwrap().to_string(), "18:00");
        assert_eq!(config.action.terminal_exit_codes, vec![2]);
        assert_eq!(config.notifications.providers.len(), 2);
        assert!(!config.notifications.providers[1].is_enabled());
        assert_eq!(config.build_jobs().unwrap().len(), 2);
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        assert!(matches!(
            AppConfig::from_toml("[schedule\nclock_in ="),
            Err(Error::Toml(_))
        ));
    }
}
