//! Logging setup and log file retention.
//!
//! This module provides:
//! - Console output with local timezone timestamps
//! - Optional daily-rolling log files
//! - Log file retention cleanup (deletes logs older than the configured days)

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "punch_clock=info,reqwest=warn,hyper=warn";

/// Default log retention period in days.
pub const DEFAULT_LOG_RETENTION_DAYS: u32 = 7;

/// Rolling log file prefix; files are named `punch-clock.log.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "punch-clock.log";

/// Formats timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Resolve the filter: explicit directive, then `RUST_LOG`, then the default.
pub fn build_filter(directive: Option<&str>) -> Result<EnvFilter> {
    match directive.map(str::trim).filter(|d| !d.is_empty()) {
        Some(directive) => EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("invalid log filter '{directive}': {e}"))),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))),
    }
}

/// Install the global subscriber.
///
/// When `log_dir` is given, logs are also written to a daily-rolling file in
/// it. Keep the returned guard alive for the lifetime of the process or
/// buffered file output is lost.
pub fn init_logging(log_dir: Option<&Path>, filter: Option<&str>) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(filter)?;

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {e}")))?;

    Ok(guard)
}

/// Delete old log files now and then once a day until `cancel_token` fires.
pub fn start_retention_cleanup(
    log_dir: PathBuf,
    retention_days: u32,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cleanup_interval = Duration::from_secs(24 * 60 * 60);

        loop {
            if let Err(e) = cleanup_old_logs(&log_dir, retention_days).await {
                warn!(error = %e, dir = %log_dir.display(), "Failed to cleanup old logs");
            }

            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Log retention cleanup task shutting down");
                    break;
                }
                _ = tokio::time::sleep(cleanup_interval) => {}
            }
        }
    })
}

/// Delete rolled log files dated more than `retention_days` ago.
///
/// Returns the number of files removed.
async fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> std::io::Result<usize> {
    let cutoff = Utc::now().date_naive() - chrono::Duration::days(i64::from(retention_days));
    let prefix = format!("{LOG_FILE_PREFIX}.");

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(date_str) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(prefix.as_str()))
        else {
            continue;
        };

        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };

        if file_date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted_count += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete old log file")
                }
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }

    Ok(deleted_count)
}
