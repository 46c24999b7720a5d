// =============================================================================
// Scheduler - named periodic jobs with pause / resume / cancel
// =============================================================================
//
// Each task runs on its own tokio task, driven either by
// `tokio::time::interval` (fixed cadence) or by the next fire time of a cron
// expression. Runs of one task never overlap: a slow job delays the next
// tick and missed ticks are skipped. A failing job is logged and the
// schedule carries on.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type JobFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A job the scheduler can run any number of times.
pub type Job = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// When a task fires.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Fixed cadence.
    Every {
        period: Duration,
        /// Run once right away instead of waiting a full period first.
        run_at_start: bool,
    },
    /// Upcoming times of a cron expression, in UTC. The expression carries a
    /// leading seconds field, e.g. `0 */5 * * * *`.
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    pub fn every(period: Duration) -> Self {
        Self::Every {
            period,
            run_at_start: false,
        }
    }

    pub fn every_secs(secs: u64) -> Self {
        Self::every(Duration::from_secs(secs))
    }

    pub fn cron(expr: &str) -> Result<Self, cron::error::Error> {
        Ok(Self::Cron(Box::new(expr.parse()?)))
    }

    /// Fire once right away. No effect on cron schedules.
    pub fn immediately(self) -> Self {
        match self {
            Self::Every { period, .. } => Self::Every {
                period,
                run_at_start: true,
            },
            cron => cron,
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Every { period, .. } => write!(f, "every {}ms", period.as_millis()),
            Self::Cron(cron) => write!(f, "cron {cron}"),
        }
    }
}

/// Control handle for one scheduled task. Cloning shares the same task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: Arc<str>,
    paused: Arc<AtomicBool>,
    runs: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl TaskHandle {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            paused: Arc::new(AtomicBool::new(false)),
            runs: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Skip upcoming runs until resumed. A run already in progress finishes.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        debug!(task = %self.name, "task paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        debug!(task = %self.name, "task resumed");
    }

    /// Stop the task for good, interrupting a run in progress.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completed runs, successful or not.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }
}

pub trait Scheduler: Send + Sync {
    fn schedule_task(&self, name: &str, schedule: Schedule, job: Job) -> TaskHandle;
}

// ---------------------------------------------------------------------------
// IntervalScheduler
// ---------------------------------------------------------------------------

struct ScheduledTask {
    handle: TaskHandle,
    join: JoinHandle<()>,
}

#[derive(Default)]
pub struct IntervalScheduler {
    tasks: Mutex<HashMap<String, ScheduledTask>>,
}

impl IntervalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, name: &str) -> Option<TaskHandle> {
        self.tasks.lock().get(name).map(|t| t.handle.clone())
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn pause_all(&self) {
        for task in self.tasks.lock().values() {
            task.handle.pause();
        }
    }

    pub fn resume_all(&self) {
        for task in self.tasks.lock().values() {
            task.handle.resume();
        }
    }

    /// Cancel every task and forget them.
    pub fn cancel_all(&self) {
        for (_, task) in self.tasks.lock().drain() {
            task.handle.cancel();
        }
    }

    /// Cancel every task and wait for them to stop.
    pub async fn shutdown(&self) {
        let tasks: Vec<ScheduledTask> = self.tasks.lock().drain().map(|(_, t)| t).collect();
        for task in tasks {
            task.handle.cancel();
            if let Err(e) = task.join.await {
                warn!(task = %task.handle.name(), error = %e, "scheduled task ended abnormally");
            }
        }
    }
}

impl Scheduler for IntervalScheduler {
    /// Scheduling a name that is already taken replaces (and cancels) the
    /// previous task.
    fn schedule_task(&self, name: &str, schedule: Schedule, job: Job) -> TaskHandle {
        let handle = TaskHandle::new(name);
        let join = tokio::spawn(run_task(handle.clone(), schedule.clone(), job));

        let previous = self.tasks.lock().insert(
            name.to_string(),
            ScheduledTask {
                handle: handle.clone(),
                join,
            },
        );
        if let Some(previous) = previous {
            warn!(task = %name, "replacing existing scheduled task");
            previous.handle.cancel();
        }

        info!(task = %name, schedule = %schedule, "task scheduled");
        handle
    }
}

impl std::fmt::Debug for IntervalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalScheduler")
            .field("tasks", &self.task_names())
            .finish()
    }
}

async fn run_task(handle: TaskHandle, schedule: Schedule, job: Job) {
    match schedule {
        Schedule::Every {
            period,
            run_at_start,
        } => run_every(&handle, period, run_at_start, &job).await,
        Schedule::Cron(cron) => run_cron(&handle, &cron, &job).await,
    }
    debug!(task = %handle.name, "scheduled task stopped");
}

async fn run_every(handle: &TaskHandle, period: Duration, run_at_start: bool, job: &Job) {
    let period = period.max(Duration::from_millis(1));
    let start = if run_at_start {
        tokio::time::Instant::now()
    } else {
        tokio::time::Instant::now() + period
    };
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if handle.is_paused() {
            continue;
        }
        if !run_once(handle, job).await {
            return;
        }
    }
}

/// Fire times already passed while a run was in progress are skipped.
async fn run_cron(handle: &TaskHandle, cron: &cron::Schedule, job: &Job) {
    let mut last_fire: Option<DateTime<Utc>> = None;

    loop {
        let now = Utc::now();
        let from = last_fire.map_or(now, |last| last.max(now));
        let Some(next) = cron.after(&from).next() else {
            info!(task = %handle.name, "cron schedule has no upcoming fire time");
            return;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        last_fire = Some(next);

        if handle.is_paused() {
            continue;
        }
        if !run_once(handle, job).await {
            return;
        }
    }
}

/// Run the job once. `false` when the task was cancelled mid-run.
async fn run_once(handle: &TaskHandle, job: &Job) -> bool {
    let started = Instant::now();
    let outcome = tokio::select! {
        biased;
        _ = handle.cancel.cancelled() => return false,
        outcome = job() => outcome,
    };
    handle.runs.fetch_add(1, Ordering::SeqCst);

    match outcome {
        Ok(()) => debug!(
            task = %handle.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scheduled task completed"
        ),
        Err(e) => warn!(task = %handle.name, error = %e, "scheduled task failed"),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_job(counter: Arc<AtomicUsize>, fail: bool) -> Job {
        Arc::new(move || -> JobFuture {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    anyhow::bail!("job failed");
                }
                Ok(())
            })
        })
    }

    const TICK: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn runs_repeatedly() {
        let scheduler = IntervalScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule_task("count", Schedule::every(TICK), counting_job(counter.clone(), false));

        tokio::time::sleep(TICK * 10).await;
        assert!(counter.load(Ordering::SeqCst) >= 3);
        assert!(handle.runs() >= 3);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn runs_at_start_when_asked() {
        let scheduler = IntervalScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_task(
            "eager",
            Schedule::every(Duration::from_secs(3600)).immediately(),
            counting_job(counter.clone(), false),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let scheduler = IntervalScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule_task("pausable", Schedule::every(TICK), counting_job(counter.clone(), false));

        tokio::time::sleep(TICK * 4).await;
        handle.pause();
        assert!(handle.is_paused());
        tokio::time::sleep(TICK * 2).await;
        let frozen = counter.load(Ordering::SeqCst);
        tokio::time::sleep(TICK * 6).await;
        assert_eq!(counter.load(Ordering::SeqCst), frozen);

        handle.resume();
        tokio::time::sleep(TICK * 6).await;
        assert!(counter.load(Ordering::SeqCst) > frozen);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_stops_the_task() {
        let scheduler = IntervalScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule_task("cancel", Schedule::every(TICK), counting_job(counter.clone(), false));

        tokio::time::sleep(TICK * 3).await;
        handle.cancel();
        assert!(handle.is_cancelled());
        tokio::time::sleep(TICK * 2).await;
        let stopped = counter.load(Ordering::SeqCst);
        tokio::time::sleep(TICK * 5).await;
        assert_eq!(counter.load(Ordering::SeqCst), stopped);
    }

    #[tokio::test]
    async fn failing_job_keeps_its_schedule() {
        let scheduler = IntervalScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_task("flaky", Schedule::every(TICK), counting_job(counter.clone(), true));

        tokio::time::sleep(TICK * 10).await;
        assert!(counter.load(Ordering::SeqCst) >= 2);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn same_name_replaces_previous_task() {
        let scheduler = IntervalScheduler::new();
        let first = scheduler.schedule_task(
            "gap-fill",
            Schedule::every(TICK),
            counting_job(Arc::new(AtomicUsize::new(0)), false),
        );
        let second = scheduler.schedule_task(
            "gap-fill",
            Schedule::every(TICK),
            counting_job(Arc::new(AtomicUsize::new(0)), false),
        );

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(scheduler.task_names(), vec!["gap-fill".to_string()]);

        scheduler.pause_all();
        assert!(second.is_paused());
        scheduler.resume_all();
        assert!(!second.is_paused());

        scheduler.cancel_all();
        assert!(second.is_cancelled());
        assert!(scheduler.task_names().is_empty());
    }

    #[tokio::test]
    async fn cron_schedule_fires_on_matching_seconds() {
        let scheduler = IntervalScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let schedule = Schedule::cron("* * * * * *").unwrap();
        assert_eq!(schedule.clone().immediately().to_string(), schedule.to_string());

        let handle = scheduler.schedule_task("every-second", schedule, counting_job(counter.clone(), false));
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let fired = counter.load(Ordering::SeqCst);
        assert!((1..=3).contains(&fired), "fired {fired} times");
        assert_eq!(handle.runs() as usize, fired);
        scheduler.shutdown().await;
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        assert!(Schedule::cron("every five minutes").is_err());
        assert!(Schedule::cron("0 */5 * * * *").is_ok());
        assert_eq!(Schedule::every_secs(2).to_string(), "every 2000ms");
    }
}
