use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use punch_clock::action::PunchKind;
use punch_clock::cli::{Args, Commands};
use punch_clock::config::AppConfig;
use punch_clock::logging;
use punch_clock::notification::DeliveryStatus;
use punch_clock::resilience::RetryExecutor;
use punch_clock::scheduler::JobScheduler;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env before the config so its variables act as overrides
    dotenvy::dotenv().ok();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("Application error: {e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config =
        AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    let log_dir = args.log_dir.or_else(|| config.logging.directory.clone());
    let log_filter = args.log_filter.or_else(|| config.logging.filter.clone());
    let _log_guard = logging::init_logging(log_dir.as_deref(), log_filter.as_deref())?;

    let shutdown = CancellationToken::new();
    if let Some(dir) = &log_dir {
        logging::start_retention_cleanup(dir.clone(), config.logging.retention_days, shutdown.clone());
    }

    let code = match args.command {
        Commands::Run => run_scheduler(&config, &shutdown).await?,
        Commands::TestNotifications => test_notifications(&config).await?,
        Commands::NextRuns => next_runs(&config)?,
        Commands::Punch { kind } => punch(&config, kind.into(), &shutdown).await?,
        Commands::CheckConfig => check_config(&config)?,
    };

    shutdown.cancel();
    Ok(code)
}

fn build_scheduler(config: &AppConfig, shutdown: &CancellationToken) -> anyhow::Result<JobScheduler> {
    let dispatcher = config
        .build_dispatcher()
        .context("Failed to initialize notifications")?
        .with_cancellation(shutdown.clone());
    let executor = RetryExecutor::new(config.breakers()).with_cancellation(shutdown.clone());

    let scheduler = JobScheduler::builder(config.scheduler_config()?, executor)
        .dispatcher(Arc::new(dispatcher))
        .build();
    for job in config.build_jobs()? {
        scheduler.schedule(job)?;
    }
    Ok(scheduler)
}

async fn run_scheduler(config: &AppConfig, shutdown: &CancellationToken) -> anyhow::Result<ExitCode> {
    let scheduler = build_scheduler(config, shutdown)?;
    if !config.schedule.enabled {
        warn!("Schedule is disabled, jobs will not fire until it is enabled");
    }

    scheduler.start()?;
    shutdown_signal().await;

    // Retry loops finish their current attempt, then give up.
    shutdown.cancel();
    scheduler.stop().await;
    Ok(ExitCode::SUCCESS)
}

async fn test_notifications(config: &AppConfig) -> anyhow::Result<ExitCode> {
    let dispatcher = config
        .build_dispatcher()
        .context("Failed to initialize notifications")?;

    if dispatcher.enabled_count() == 0 {
        println!("No enabled notification providers configured");
        return Ok(ExitCode::FAILURE);
    }

    let report = dispatcher.test_connections().await;
    for result in &report.results {
        match &result.status {
            DeliveryStatus::Delivered { attempts } => {
                println!("  OK    {} ({}) after {attempts} attempt(s)", result.provider, result.kind)
            }
            DeliveryStatus::Skipped(reason) => {
                println!("  SKIP  {} ({}): {reason}", result.provider, result.kind)
            }
            DeliveryStatus::Failed { kind, message, .. } => {
                println!("  FAIL  {} ({}): [{kind}] {message}", result.provider, result.kind)
            }
            DeliveryStatus::TimedOut => {
                println!("  FAIL  {} ({}): timed out", result.provider, result.kind)
            }
        }
    }
    println!("{}", report.summary());

    Ok(if report.all_delivered() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn next_runs(config: &AppConfig) -> anyhow::Result<ExitCode> {
    let tz = config.tz()?;
    let now = Utc::now().with_timezone(&tz);

    for kind in PunchKind::ALL {
        let trigger = config.trigger(kind)?;
        let next = if config.schedule.enabled {
            trigger
                .next_fire_after(&now)
                .map(|t| t.format("%a %Y-%m-%d %H:%M %Z").to_string())
                .unwrap_or_else(|| "none".to_string())
        } else {
            "disabled".to_string()
        };
        println!("{:<10} {:<18} {next}", kind.label(), trigger.to_string());
    }
    Ok(ExitCode::SUCCESS)
}

async fn punch(
    config: &AppConfig,
    kind: PunchKind,
    shutdown: &CancellationToken,
) -> anyhow::Result<ExitCode> {
    let scheduler = build_scheduler(config, shutdown)?;

    let run = scheduler.trigger_now(kind.job_id());
    tokio::pin!(run);
    let report = tokio::select! {
        report = &mut run => report?,
        _ = shutdown_signal() => {
            warn!("Interrupted, abandoning remaining retries");
            shutdown.cancel();
            run.await?
        }
    };

    info!(
        action = %kind,
        attempts = report.attempts,
        success = report.is_success(),
        "Manual punch finished"
    );
    println!(
        "{}: {} after {} attempt(s): {}",
        kind.label(),
        if report.is_success() { "succeeded" } else { "failed" },
        report.attempts,
        report.outcome.message()
    );

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn check_config(config: &AppConfig) -> anyhow::Result<ExitCode> {
    println!("Configuration OK");
    println!("  timezone        {}", config.tz()?);
    println!("  clock in        {}", config.trigger(PunchKind::ClockIn)?);
    println!("  clock out       {}", config.trigger(PunchKind::ClockOut)?);
    println!("  schedule        {}", if config.schedule.enabled { "enabled" } else { "disabled" });
    println!(
        "  retry           {} attempts, {}ms base, {}ms max",
        config.retry.max_attempts, config.retry.backoff.base_delay_ms, config.retry.backoff.max_delay_ms
    );
    println!(
        "  circuit breaker {} failures, {}s cooldown",
        config.circuit_breaker.failure_threshold, config.circuit_breaker.cooldown_secs
    );
    println!(
        "  action          {}",
        config.action.program.as_deref().unwrap_or("(not configured)")
    );
    if config.notifications.providers.is_empty() {
        println!("  notifications   (none)");
    }
    for provider in &config.notifications.providers {
        let settings = provider.settings();
        println!(
            "  notifications   {} ({}), {}, min level {}",
            provider.name(),
            provider.kind(),
            if settings.enabled { "enabled" } else { "disabled" },
            settings.min_level
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
