//! Scheduler for cron-based job execution
//!
//! Manages the three background jobs with support for:
//! - Cron expression parsing
//! - Timezone-aware scheduling
//! - Sleep/wake detection via time-jump polling
//! - Missed job handling (runs if within grace period)
//! - Re-entrancy suppression per job id

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use crate::config::ScheduleEntry;
use crate::error::PulseError;
use crate::jobs;
use crate::state::PulseState;
use crate::types::{JobId, JobReport, JobTrigger};

/// Grace period for missed jobs (2 hours)
const MISSED_JOB_GRACE_PERIOD_SECS: i64 = 7200;

/// Time jump threshold to detect sleep/wake (5 minutes)
const TIME_JUMP_THRESHOLD_SECS: i64 = 300;

/// How far past a slot a poll may land and still count as on time
const DUE_WINDOW_SECS: i64 = 120;

/// Per-job view for diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job: JobId,
    pub enabled: bool,
    pub cron: String,
    pub timezone: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scheduled: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<JobReport>,
}

/// Removes its job from the running set when the run ends, panics included
struct RunGuard {
    job: JobId,
    running: Arc<Mutex<HashSet<JobId>>>,
}

impl RunGuard {
    fn acquire(running: &Arc<Mutex<HashSet<JobId>>>, job: JobId) -> Option<Self> {
        if !running.lock().insert(job) {
            return None;
        }
        Some(Self {
            job,
            running: Arc::clone(running),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.job);
    }
}

/// Scheduler for managing job execution times
pub struct Scheduler {
    state: Arc<PulseState>,
    running: Arc<Mutex<HashSet<JobId>>>,
    tasks: Mutex<JoinSet<()>>,
    shutdown: Notify,
    stopping: AtomicBool,
}

impl Scheduler {
    pub fn new(state: Arc<PulseState>) -> Self {
        Self {
            state,
            running: Arc::new(Mutex::new(HashSet::new())),
            tasks: Mutex::new(JoinSet::new()),
            shutdown: Notify::new(),
            stopping: AtomicBool::new(false),
        }
    }

    /// Start the scheduler loop
    ///
    /// Checks for due jobs every poll interval until `shutdown` is called.
    /// It also handles sleep/wake detection.
    pub async fn run(&self) {
        let poll_secs = self.state.config.scheduler.poll_interval_secs.max(1);
        let mut last_check = self.state.now();
        log::info!("Scheduler: started (poll every {}s)", poll_secs);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(poll_secs)) => {}
                _ = self.shutdown.notified() => break,
            }
            if self.is_stopping() {
                break;
            }

            let now = self.state.now();

            // Detect sleep: the gap overshot the poll interval by more than 5 minutes
            let time_jump = (now - last_check).num_seconds() - poll_secs as i64;
            if time_jump > TIME_JUMP_THRESHOLD_SECS {
                log::info!(
                    "Scheduler: detected system wake (time jumped {} seconds), checking for missed jobs",
                    time_jump
                );
                self.check_missed_jobs(now);
            }

            self.tick(now);
            last_check = now;
        }

        log::info!("Scheduler: loop stopped");
    }

    /// Trigger every enabled job whose slot is due at `now`.
    ///
    /// The slot is marked handled even when the run is suppressed because
    /// the previous run is still going.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut started = Vec::new();
        for job in JobId::ALL {
            let entry = self.state.config.schedules.entry(job);
            if !entry.enabled {
                continue;
            }
            match self.due_slot(entry, job, now) {
                Ok(Some(slot)) => {
                    self.state.set_last_scheduled_run(job, slot);
                    if self.trigger(job, JobTrigger::Scheduled) {
                        started.push(job);
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("Scheduler: cannot evaluate {}: {}", job, e),
            }
        }
        started
    }

    /// Check for jobs that were missed during sleep
    pub fn check_missed_jobs(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut started = Vec::new();
        for job in JobId::ALL {
            let entry = self.state.config.schedules.entry(job);
            if !entry.enabled {
                continue;
            }
            match self.find_missed_job(entry, job, now) {
                Ok(Some(slot)) => {
                    log::info!("Scheduler: found missed '{}' job from {}, running now", job, slot);
                    self.state.set_last_scheduled_run(job, slot);
                    if self.trigger(job, JobTrigger::Missed) {
                        started.push(job);
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("Scheduler: cannot evaluate {}: {}", job, e),
            }
        }
        started
    }

    /// Start a run of `job` in the background.
    ///
    /// Returns false if a previous run is still in flight or the scheduler is
    /// shutting down.
    pub fn trigger(&self, job: JobId, trigger: JobTrigger) -> bool {
        if self.is_stopping() {
            log::debug!("Scheduler: shutting down, ignoring {:?} trigger for {}", trigger, job);
            return false;
        }
        let Some(guard) = RunGuard::acquire(&self.running, job) else {
            log::warn!("Scheduler: {} still running, skipping {:?} trigger", job, trigger);
            return false;
        };

        let state = Arc::clone(&self.state);
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let _guard = guard;
            jobs::run_job(&state, job, trigger).await;
        });
        true
    }

    pub fn is_running(&self, job: JobId) -> bool {
        self.running.lock().contains(&job)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Wait until every in-flight run has finished
    pub async fn wait_for_running(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                log::error!("Scheduler: job task ended abnormally: {}", e);
            }
        }
    }

    /// Stop issuing triggers and let in-flight runs complete
    pub async fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
        self.wait_for_running().await;
        log::info!("Scheduler: shut down");
    }

    pub fn status(&self, job: JobId) -> JobStatus {
        let entry = self.state.config.schedules.entry(job);
        JobStatus {
            job,
            enabled: entry.enabled,
            cron: entry.cron.clone(),
            timezone: entry.timezone.clone(),
            running: self.is_running(job),
            last_scheduled: self.state.get_last_scheduled_run(job),
            next_run: get_next_run_time(entry, self.state.now()).ok(),
            last_report: self.state.last_report(job),
        }
    }

    /// The slot that makes `job` due at `now`, if any and not yet handled
    fn due_slot(
        &self,
        entry: &ScheduleEntry,
        job: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, PulseError> {
        let schedule = parse_cron(&entry.cron)?;
        let tz = parse_timezone(&entry.timezone)?;

        let window = chrono::Duration::seconds(DUE_WINDOW_SECS);
        let window_start = (now - window).with_timezone(&tz);

        // Most recent slot in (now - window, now]
        let slot = schedule
            .after(&window_start)
            .map(|t| t.with_timezone(&Utc))
            .take_while(|t| *t <= now)
            .last();
        let Some(slot) = slot else {
            return Ok(None);
        };

        if let Some(last) = self.state.get_last_scheduled_run(job) {
            if last >= slot {
                return Ok(None); // Already ran
            }
        }
        Ok(Some(slot))
    }

    /// Find a missed job within the grace period
    fn find_missed_job(
        &self,
        entry: &ScheduleEntry,
        job: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, PulseError> {
        let schedule = parse_cron(&entry.cron)?;
        let tz = parse_timezone(&entry.timezone)?;

        let grace_start =
            (now - chrono::Duration::seconds(MISSED_JOB_GRACE_PERIOD_SECS)).with_timezone(&tz);
        let last_run = self.state.get_last_scheduled_run(job);

        // Latest slot in the grace period that has not run; one catch-up covers them all
        let missed = schedule
            .after(&grace_start)
            .map(|t| t.with_timezone(&Utc))
            .take_while(|t| *t <= now)
            .filter(|t| last_run.map_or(true, |last| last < *t))
            .last();
        Ok(missed)
    }
}

/// Parse a cron expression
pub fn parse_cron(expr: &str) -> Result<Schedule, PulseError> {
    // The cron crate expects 6 fields (with seconds), but we use 5-field format
    // Add "0" for seconds at the start
    let full_expr = format!("0 {}", expr);

    full_expr.parse::<Schedule>().map_err(|e| {
        PulseError::Configuration(format!("Invalid cron expression '{}': {}", expr, e))
    })
}

pub fn parse_timezone(name: &str) -> Result<Tz, PulseError> {
    name.parse::<Tz>()
        .map_err(|_| PulseError::Configuration(format!("Invalid timezone: {}", name)))
}

/// Get the first scheduled time for an entry strictly after `after`
pub fn get_next_run_time(
    entry: &ScheduleEntry,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, PulseError> {
    let schedule = parse_cron(&entry.cron)?;
    let tz = parse_timezone(&entry.timezone)?;

    let next = schedule
        .after(&after.with_timezone(&tz))
        .next()
        .ok_or_else(|| PulseError::Configuration("No upcoming scheduled time".to_string()))?;

    Ok(next.with_timezone(&Utc))
}
