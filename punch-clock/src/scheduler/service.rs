//! Job scheduler service.
//!
//! A single background loop owns trigger bookkeeping. It sleeps until the
//! earliest next fire time, hands every due job to its own task and
//! re-derives that job's next fire time from the clock. Job executions run
//! on a [`TaskTracker`] so a slow retry loop never delays other jobs and
//! `stop()` can wait for in-flight runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::clock::{Clock, SystemClock};
use super::job::{Job, JobStatus};
use crate::notification::{NotificationDispatcher, NotificationEvent, SchedulerEventKind};
use crate::resilience::{RetryExecutor, RetryPolicy, RetryReport};
use crate::{Error, Result};

/// Default heartbeat interval (5 minutes).
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 300;

/// Default lateness tolerated before a fire is dropped.
const DEFAULT_MISFIRE_GRACE_SECS: u64 = 30;

/// Longest single sleep of the loop. Wall-clock changes are picked up at
/// least this often.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Timezone triggers are evaluated in.
    pub timezone: Tz,
    /// Retry policy for jobs without their own.
    pub retry: RetryPolicy,
    /// A fire noticed later than this after its due time is skipped.
    pub misfire_grace: Duration,
    /// Interval of the status heartbeat, `None` to disable.
    pub status_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Asia::Taipei,
            retry: RetryPolicy::default(),
            misfire_grace: Duration::from_secs(DEFAULT_MISFIRE_GRACE_SECS),
            status_interval: Some(Duration::from_secs(DEFAULT_STATUS_INTERVAL_SECS)),
        }
    }
}

/// Bookkeeping for one scheduled job.
struct JobEntry {
    job: Arc<Job>,
    next_fire: Option<DateTime<Tz>>,
    last_fire: Option<DateTime<Utc>>,
    last_outcome: Option<String>,
    run_count: u64,
    running: Arc<AtomicBool>,
}

impl JobEntry {
    fn status(&self) -> JobStatus {
        JobStatus {
            id: self.job.id.clone(),
            name: self.job.name.clone(),
            trigger: self.job.trigger,
            enabled: self.job.enabled,
            running: self.running.load(Ordering::SeqCst),
            next_fire: self.next_fire,
            last_fire: self.last_fire,
            last_outcome: self.last_outcome.clone(),
            run_count: self.run_count,
        }
    }
}

/// A job picked by the loop for execution.
struct DueRun {
    job: Arc<Job>,
    running: Arc<AtomicBool>,
}

/// State shared between the scheduler handle, its loop and job tasks.
struct SchedulerInner {
    config: SchedulerConfig,
    executor: RetryExecutor,
    dispatcher: Option<Arc<NotificationDispatcher>>,
    clock: Arc<dyn Clock>,
    jobs: RwLock<BTreeMap<String, JobEntry>>,
    wake: Notify,
    tracker: TaskTracker,
}

/// Handle of a running loop.
struct LoopHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Builder for [`JobScheduler`].
pub struct JobSchedulerBuilder {
    config: SchedulerConfig,
    executor: RetryExecutor,
    dispatcher: Option<Arc<NotificationDispatcher>>,
    clock: Arc<dyn Clock>,
}

impl JobSchedulerBuilder {
    /// Publish run results and lifecycle events through `dispatcher`.
    pub fn dispatcher(mut self, dispatcher: Arc<NotificationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> JobScheduler {
        JobScheduler {
            inner: Arc::new(SchedulerInner {
                config: self.config,
                executor: self.executor,
                dispatcher: self.dispatcher,
                clock: self.clock,
                jobs: RwLock::new(BTreeMap::new()),
                wake: Notify::new(),
                tracker: TaskTracker::new(),
            }),
            running: Mutex::new(None),
        }
    }
}

/// Fires jobs at their trigger times.
///
/// Owned explicitly by the process entry point: `start()` spawns the loop,
/// `stop()` cancels future fires and waits for in-flight runs.
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
    running: Mutex<Option<LoopHandle>>,
}

impl JobScheduler {
    pub fn builder(config: SchedulerConfig, executor: RetryExecutor) -> JobSchedulerBuilder {
        JobSchedulerBuilder {
            config,
            executor,
            dispatcher: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.inner.config.timezone
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Register a job. Ids must be unique.
    pub fn schedule(&self, job: Job) -> Result<()> {
        job.validate()?;

        let now = self.inner.now_local();
        {
            let mut jobs = self.inner.jobs.write();
            if jobs.contains_key(&job.id) {
                return Err(Error::config(format!(
                    "job '{}' is already scheduled",
                    job.id
                )));
            }

            let next_fire = self.inner.next_fire(&job, &now);
            info!(
                job_id = %job.id,
                trigger = %job.trigger,
                enabled = job.enabled,
                next_fire = ?next_fire,
                "Job scheduled"
            );
            jobs.insert(
                job.id.clone(),
                JobEntry {
                    job: Arc::new(job),
                    next_fire,
                    last_fire: None,
                    last_outcome: None,
                    run_count: 0,
                    running: Arc::new(AtomicBool::new(false)),
                },
            );
        }

        self.inner.wake.notify_one();
        Ok(())
    }

    /// Spawn the scheduling loop.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        self.inner.tracker.reopen();
        self.inner.refresh_next_fires();

        let token = CancellationToken::new();
        let task = tokio::spawn(self.inner.clone().run_loop(token.clone()));
        *running = Some(LoopHandle { token, task });
        drop(running);

        let upcoming = self.next_fire_times();
        info!(
            jobs = upcoming.len(),
            timezone = %self.inner.config.timezone,
            "Scheduler started"
        );
        for (job_id, next_fire) in &upcoming {
            info!(job_id = %job_id, next_fire = ?next_fire, "Next fire");
        }

        if let Some(dispatcher) = self.inner.dispatcher.clone() {
            let mut description = String::new();
            for (job_id, next_fire) in &upcoming {
                let when = next_fire
                    .map(|t| t.format("%Y-%m-%d %H:%M %Z").to_string())
                    .unwrap_or_else(|| "never".to_string());
                description.push_str(&format!("{job_id}: {when}\n"));
            }
            let event = NotificationEvent::scheduler(SchedulerEventKind::Started, description);
            self.inner.tracker.spawn(async move {
                dispatcher.publish(event).await;
            });
        }

        Ok(())
    }

    /// Cancel future fires and wait for in-flight runs. No-op when stopped.
    pub async fn stop(&self) {
        let Some(handle) = self.running.lock().take() else {
            debug!("Scheduler is not running");
            return;
        };

        info!("Stopping scheduler");
        handle.token.cancel();
        if let Err(e) = handle.task.await {
            error!(error = %e, "Scheduler loop terminated abnormally");
        }

        self.inner.tracker.close();
        let in_flight = self.inner.tracker.len();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight jobs to finish");
        }
        self.inner.tracker.wait().await;

        if let Some(dispatcher) = &self.inner.dispatcher {
            dispatcher
                .publish(NotificationEvent::scheduler(
                    SchedulerEventKind::Stopped,
                    "No further punches will be scheduled",
                ))
                .await;
        }
        info!("Scheduler stopped");
    }

    /// Run a job immediately through the full pipeline.
    pub async fn trigger_now(&self, job_id: &str) -> Result<RetryReport> {
        let job = {
            let mut jobs = self.inner.jobs.write();
            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::config(format!("unknown job '{job_id}'")))?;
            entry.last_fire = Some(self.inner.clock.now());
            entry.run_count += 1;
            entry.job.clone()
        };

        info!(job_id = %job_id, "Manually triggering job");
        let result = self.inner.execute_guarded(job.clone()).await;
        self.inner.finish_run(&job, &result).await;
        result
    }

    pub fn job_statuses(&self) -> Vec<JobStatus> {
        self.inner.jobs.read().values().map(JobEntry::status).collect()
    }

    /// Next fire time of every job, ordered by job id.
    pub fn next_fire_times(&self) -> Vec<(String, Option<DateTime<Tz>>)> {
        self.inner
            .jobs
            .read()
            .values()
            .map(|entry| (entry.job.id.clone(), entry.next_fire))
            .collect()
    }
}

impl SchedulerInner {
    fn now_local(&self) -> DateTime<Tz> {
        self.clock.now().with_timezone(&self.config.timezone)
    }

    fn next_fire(&self, job: &Job, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        if !job.enabled {
            return None;
        }
        let next = job.trigger.next_fire_after(after);
        if next.is_none() {
            warn!(job_id = %job.id, trigger = %job.trigger, "No upcoming fire time for job");
        }
        next
    }

    fn refresh_next_fires(&self) {
        let now = self.now_local();
        for entry in self.jobs.write().values_mut() {
            entry.next_fire = self.next_fire(&entry.job, &now);
        }
    }

    fn time_until_next_due(&self) -> Duration {
        let now = self.clock.now();
        let next_due = self.jobs.read().values().filter_map(|e| e.next_fire).min();
        match next_due {
            Some(due) => (due.with_timezone(&Utc) - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(MAX_SLEEP),
            None => MAX_SLEEP,
        }
    }

    /// Collect due jobs and advance their next fire times.
    fn take_due(&self) -> Vec<DueRun> {
        let now_utc = self.clock.now();
        let now = now_utc.with_timezone(&self.config.timezone);
        let mut due = Vec::new();

        for entry in self.jobs.write().values_mut() {
            let Some(scheduled) = entry.next_fire else {
                continue;
            };
            if scheduled > now {
                continue;
            }
            entry.next_fire = self.next_fire(&entry.job, &now);

            let lateness = (now - scheduled).to_std().unwrap_or(Duration::ZERO);
            if lateness > self.config.misfire_grace {
                warn!(
                    job_id = %entry.job.id,
                    scheduled = %scheduled,
                    late_by = ?lateness,
                    next_fire = ?entry.next_fire,
                    "Missed fire time, skipping run"
                );
                continue;
            }

            if entry
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                warn!(
                    job_id = %entry.job.id,
                    next_fire = ?entry.next_fire,
                    "Previous run still in progress, skipping fire"
                );
                continue;
            }

            debug!(job_id = %entry.job.id, scheduled = %scheduled, "Job due");
            entry.last_fire = Some(now_utc);
            entry.run_count += 1;
            due.push(DueRun {
                job: entry.job.clone(),
                running: entry.running.clone(),
            });
        }

        due
    }

    async fn run_loop(self: Arc<Self>, token: CancellationToken) {
        let mut heartbeat = self.config.status_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let sleep_for = self.time_until_next_due();

            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!("Scheduler loop cancelled");
                    break;
                }

                _ = self.wake.notified() => {
                    debug!("Scheduler loop woken");
                }

                _ = heartbeat_tick(&mut heartbeat) => {
                    self.log_status();
                }

                _ = tokio::time::sleep(sleep_for) => {
                    for run in self.take_due() {
                        self.spawn_run(run);
                    }
                }
            }
        }
    }

    fn spawn_run(self: &Arc<Self>, run: DueRun) {
        let inner = self.clone();
        self.tracker.spawn(async move {
            let result = inner.execute_guarded(run.job.clone()).await;
            inner.finish_run(&run.job, &result).await;
            run.running.store(false, Ordering::SeqCst);
        });
    }

    /// Run `job` on its own task so a panic outside the action is contained.
    async fn execute_guarded(self: &Arc<Self>, job: Arc<Job>) -> Result<RetryReport> {
        let inner = self.clone();
        let task_job = job.clone();
        match tokio::spawn(async move { inner.execute(&task_job).await }).await {
            Ok(report) => Ok(report),
            Err(e) if e.is_panic() => Err(Error::job(&job.id, "execution panicked")),
            Err(e) => Err(Error::job(&job.id, e.to_string())),
        }
    }

    async fn execute(&self, job: &Job) -> RetryReport {
        let policy = job.retry.as_ref().unwrap_or(&self.config.retry);
        info!(job_id = %job.id, operation = %job.operation, "Running job");

        let report = self
            .executor
            .run_action(&job.operation, policy, job.action.as_ref())
            .await;

        match report.outcome.error_kind() {
            None => info!(
                job_id = %job.id,
                attempts = report.attempts,
                message = %report.outcome.message(),
                "Job succeeded"
            ),
            Some(kind) => error!(
                job_id = %job.id,
                attempts = report.attempts,
                kind = %kind,
                error = %report.outcome.message(),
                "Job failed"
            ),
        }

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.publish(job.result_event(&report)).await;
        }
        report
    }

    async fn finish_run(&self, job: &Job, result: &Result<RetryReport>) {
        let summary = match result {
            Ok(report) => match report.outcome.error_kind() {
                None => "success".to_string(),
                Some(kind) => format!("failure ({kind})"),
            },
            Err(e) => format!("error: {e}"),
        };
        if let Some(entry) = self.jobs.write().get_mut(&job.id) {
            entry.last_outcome = Some(summary);
        }

        if let Err(e) = result {
            error!(job_id = %job.id, error = %e, "Job execution error");
            if let Some(dispatcher) = &self.dispatcher {
                dispatcher
                    .publish(
                        NotificationEvent::scheduler(SchedulerEventKind::Error, e.to_string())
                            .with_field("Job", job.id.clone()),
                    )
                    .await;
            }
        }
    }

    fn log_status(&self) {
        for entry in self.jobs.read().values() {
            info!(
                job_id = %entry.job.id,
                enabled = entry.job.enabled,
                running = entry.running.load(Ordering::SeqCst),
                next_fire = ?entry.next_fire,
                last_outcome = entry.last_outcome.as_deref().unwrap_or("-"),
                "Scheduler status"
            );
        }
    }
}

async fn heartbeat_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use chrono::{Datelike, TimeZone, Weekday};
    use chrono_tz::Asia::Taipei;

    use super::*;
    use crate::action::{Action, ActionOutcome, ErrorKind, FnAction, PunchKind};
    use crate::notification::channels::DeliveryError;
    use crate::notification::{NotificationProvider, ProviderSettings};
    use crate::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry};
    use crate::scheduler::clock::AnchoredClock;
    use crate::scheduler::{TimeOfDay, Trigger};

    /// Clock moved by hand.
    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn set(&self, now: DateTime<Utc>) {
            *self.0.lock() = now;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    #[derive(Default)]
    struct RecordingProvider {
        titles: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationProvider for RecordingProvider {
        fn kind(&self) -> &'static str {
            "test"
        }

        fn name(&self) -> &str {
            "recorder"
        }

        async fn send(&self, event: &NotificationEvent) -> std::result::Result<(), DeliveryError> {
            self.titles.lock().push(event.title.clone());
            Ok(())
        }
    }

    /// 2024-01-02 (a Tuesday) in Taipei.
    fn tuesday(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Taipei
            .with_ymd_and_hms(2024, 1, 2, h, m, s)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn executor() -> RetryExecutor {
        RetryExecutor::new(Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default(),
        )))
    }

    fn scheduler(clock: Arc<dyn Clock>) -> JobScheduler {
        JobScheduler::builder(SchedulerConfig::default(), executor())
            .clock(clock)
            .build()
    }

    fn at(h: u32, m: u32) -> Trigger {
        Trigger::weekdays(TimeOfDay::new(h, m).unwrap())
    }

    fn counting(counter: Arc<AtomicU32>) -> Arc<dyn Action> {
        FnAction::shared(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                ActionOutcome::success("ok")
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_job_id_rejected() {
        let scheduler = scheduler(Arc::new(AnchoredClock::new(tuesday(8, 0, 0))));
        let counter = Arc::new(AtomicU32::new(0));

        scheduler
            .schedule(Job::new("a", at(9, 0), counting(counter.clone())))
            .unwrap();
        let err = scheduler
            .schedule(Job::new("a", at(18, 0), counting(counter)))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(scheduler.job_statuses().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails_and_stop_is_idempotent() {
        let scheduler = scheduler(Arc::new(AnchoredClock::new(tuesday(8, 0, 0))));

        scheduler.start().unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(scheduler.start(), Err(Error::AlreadyRunning)));

        scheduler.stop().await;
        assert!(!scheduler.is_running());
        scheduler.stop().await;

        scheduler.start().unwrap();
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_trigger_time_and_reschedules() {
        let clock = Arc::new(AnchoredClock::new(tuesday(8, 59, 0)));
        let scheduler = scheduler(clock.clone());
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule(Job::new("morning", at(9, 0), counting(counter.clone())))
            .unwrap();

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let status = &scheduler.job_statuses()[0];
        assert_eq!(status.run_count, 1);
        assert_eq!(status.last_outcome.as_deref(), Some("success"));
        assert_eq!(status.last_fire, Some(tuesday(9, 0, 0)));
        let next = status.next_fire.unwrap();
        assert_eq!(next.weekday(), Weekday::Wed);
        assert_eq!(next.with_timezone(&Utc), tuesday(9, 0, 0) + chrono::Duration::days(1));

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_in_same_minute_both_fire() {
        let scheduler = scheduler(Arc::new(AnchoredClock::new(tuesday(8, 59, 30))));
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule(Job::new("first", at(9, 0), counting(first.clone())))
            .unwrap();
        scheduler
            .schedule(Job::new("second", at(9, 0), counting(second.clone())))
            .unwrap();

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        scheduler.stop().await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_weekend_days_are_skipped() {
        // 2024-01-05 is a Friday.
        let friday = Taipei
            .with_ymd_and_hms(2024, 1, 5, 10, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let scheduler = scheduler(Arc::new(AnchoredClock::new(friday)));
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule(Job::new("morning", at(9, 0), counting(counter.clone())))
            .unwrap();

        scheduler.start().unwrap();
        // Friday 10:00 -> Monday 08:00.
        tokio::time::sleep(Duration::from_secs(70 * 3600)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_fire_is_skipped() {
        let clock = Arc::new(ManualClock(Mutex::new(tuesday(8, 59, 0))));
        let scheduler = scheduler(clock.clone());
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule(Job::new("morning", at(9, 0), counting(counter.clone())))
            .unwrap();
        scheduler.start().unwrap();

        // The host was suspended through the fire time.
        clock.set(tuesday(9, 5, 0));
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let status = &scheduler.job_statuses()[0];
        assert_eq!(status.run_count, 0);
        assert_eq!(status.next_fire.unwrap().weekday(), Weekday::Wed);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_fire_is_skipped() {
        let scheduler = scheduler(Arc::new(AnchoredClock::new(tuesday(8, 59, 0))));
        let counter = Arc::new(AtomicU32::new(0));
        let action = {
            let counter = counter.clone();
            FnAction::shared(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(25 * 3600)).await;
                    ActionOutcome::success("slow")
                }
            })
        };
        scheduler
            .schedule(Job::new("slow", Trigger::daily(TimeOfDay::new(9, 0).unwrap()), action))
            .unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_secs(24 * 3600 + 120)).await;
        let status = &scheduler.job_statuses()[0];
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(status.run_count, 1);
        assert!(status.running);

        scheduler.stop().await;
        assert!(!scheduler.job_statuses()[0].running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_does_not_stop_scheduler() {
        let scheduler = scheduler(Arc::new(AnchoredClock::new(tuesday(8, 59, 0))));
        let calls = Arc::new(AtomicU32::new(0));
        let action = {
            let calls = calls.clone();
            FnAction::shared(move || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("browser crashed");
                    }
                    ActionOutcome::success("ok")
                }
            })
        };
        let job = Job::new("flaky", at(9, 0), action)
            .with_retry(RetryPolicy::new(1, Default::default()));
        scheduler.schedule(job).unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        let status = &scheduler.job_statuses()[0];
        assert_eq!(status.last_outcome.as_deref(), Some("failure (unknown)"));

        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        let status = &scheduler.job_statuses()[0];
        assert_eq!(status.run_count, 2);
        assert_eq!(status.last_outcome.as_deref(), Some("success"));
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_while_running_wakes_loop() {
        let clock = Arc::new(AnchoredClock::new(tuesday(8, 59, 30)));
        let scheduler = scheduler(clock.clone());
        scheduler.start().unwrap();
        tokio::task::yield_now().await;

        let fired_at = Arc::new(Mutex::new(None));
        let action = {
            let fired_at = fired_at.clone();
            let clock = clock.clone();
            FnAction::shared(move || {
                let fired_at = fired_at.clone();
                let clock = clock.clone();
                async move {
                    *fired_at.lock() = Some(clock.now());
                    ActionOutcome::success("ok")
                }
            })
        };
        scheduler.schedule(Job::new("late", at(9, 0), action)).unwrap();

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(*fired_at.lock(), Some(tuesday(9, 0, 0)));
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_run() {
        let scheduler = scheduler(Arc::new(AnchoredClock::new(tuesday(8, 59, 59))));
        let finished = Arc::new(AtomicBool::new(false));
        let action = {
            let finished = finished.clone();
            FnAction::shared(move || {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    finished.store(true, Ordering::SeqCst);
                    ActionOutcome::success("ok")
                }
            })
        };
        scheduler.schedule(Job::new("slow", at(9, 0), action)).unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(scheduler.job_statuses()[0].running);
        assert!(!finished.load(Ordering::SeqCst));

        scheduler.stop().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_now() {
        let scheduler = scheduler(Arc::new(AnchoredClock::new(tuesday(12, 0, 0))));
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule(Job::new("manual", at(9, 0), counting(counter.clone())))
            .unwrap();

        let report = scheduler.trigger_now("manual").await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.job_statuses()[0].run_count, 1);

        assert!(matches!(
            scheduler.trigger_now("missing").await,
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_via_trigger_now() {
        let scheduler = scheduler(Arc::new(AnchoredClock::new(tuesday(12, 0, 0))));
        let action = FnAction::shared(|| async {
            ActionOutcome::failure(ErrorKind::InvalidConfig, "bad credentials file")
        });
        scheduler
            .schedule(Job::punch(PunchKind::ClockIn, at(9, 0), action))
            .unwrap();

        let report = scheduler.trigger_now("clock_in_job").await.unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(report.outcome.error_kind(), Some(ErrorKind::InvalidConfig));
        assert_eq!(
            scheduler.job_statuses()[0].last_outcome.as_deref(),
            Some("failure (invalid_config)")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_job_never_fires() {
        let scheduler = scheduler(Arc::new(AnchoredClock::new(tuesday(8, 59, 0))));
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule(Job::new("off", at(9, 0), counting(counter.clone())).with_enabled(false))
            .unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.next_fire_times(), vec![("off".to_string(), None)]);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_and_result_notifications() {
        let recorder = Arc::new(RecordingProvider::default());
        let mut dispatcher = NotificationDispatcher::empty("Punch Clock", Duration::from_secs(60));
        dispatcher
            .add_provider(
                ProviderSettings {
                    rate_limit_interval_ms: 0,
                    ..Default::default()
                },
                recorder.clone(),
            )
            .unwrap();

        let scheduler = JobScheduler::builder(SchedulerConfig::default(), executor())
            .dispatcher(Arc::new(dispatcher))
            .clock(Arc::new(AnchoredClock::new(tuesday(8, 59, 0))))
            .build();
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule(Job::punch(PunchKind::ClockIn, at(9, 0), counting(counter)))
            .unwrap();

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        scheduler.stop().await;

        assert_eq!(
            *recorder.titles.lock(),
            vec![
                "Scheduler started".to_string(),
                "Clock in succeeded".to_string(),
                "Scheduler stopped".to_string(),
            ]
        );
    }
}
