//! Background loop shared by the retraining scheduler and the prediction
//! updater.
//!
//! The loop sleeps until the earliest next run (never longer than
//! `max_tick`), wakes early on reschedule or cancellation, and runs due jobs
//! one at a time on the blocking pool.

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::ConfigError;
use crate::model::ModelError;
use crate::observability::{log_scheduler_state, SchedulerState};
use crate::schedule::Schedule;
use crate::store::StoreError;

pub const DEFAULT_MAX_TICK: Duration = Duration::from_secs(60);
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler must be started from within a tokio runtime")]
    NoRuntime,
    #[error("scheduler state lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("metrics log access failed: {0}")]
    MetricsLog(#[from] std::io::Error),
}

/// The jobs a worker runs and how to run them.
pub trait JobSource: Send + Sync + 'static {
    type Job: Copy + PartialEq + Debug + Send + 'static;

    fn name(&self) -> &'static str;

    fn timezone(&self) -> Tz;

    /// Currently enabled jobs. Re-read after every reschedule.
    fn jobs(&self) -> Vec<(Self::Job, Schedule)>;

    /// Blocking body of one job run. Failures are the job's to log.
    fn run(&self, job: Self::Job);
}

/// Next run time for every enabled job.
pub fn plan<S: JobSource + ?Sized>(source: &S, now: DateTime<Utc>) -> Vec<(S::Job, DateTime<Utc>)> {
    let tz = source.timezone();
    source
        .jobs()
        .into_iter()
        .filter_map(|(job, schedule)| schedule.next_run_after(now, tz).map(|at| (job, at)))
        .collect()
}

struct RunningLoop {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ScheduledWorker<S: JobSource> {
    source: Arc<S>,
    max_tick: Duration,
    running: Mutex<Option<RunningLoop>>,
    reschedule: Arc<Notify>,
    active_loops: Arc<AtomicUsize>,
}

impl<S: JobSource> ScheduledWorker<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            max_tick: DEFAULT_MAX_TICK,
            running: Mutex::new(None),
            reschedule: Arc::new(Notify::new()),
            active_loops: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawns the loop. Returns `false` and logs a warning when it is
    /// already running.
    pub fn start(&self) -> Result<bool, SchedulerError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let mut running = self.running.lock().map_err(|_| SchedulerError::LockPoisoned)?;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            log_scheduler_state(self.source.name(), SchedulerState::AlreadyRunning, None);
            return Ok(false);
        }

        let (cancel, cancelled) = watch::channel(false);
        let handle = runtime.spawn(run_loop(
            Arc::clone(&self.source),
            self.max_tick,
            Arc::clone(&self.reschedule),
            cancelled,
            Arc::clone(&self.active_loops),
        ));
        *running = Some(RunningLoop { cancel, handle });
        log_scheduler_state(self.source.name(), SchedulerState::Started, self.next_run());
        Ok(true)
    }

    /// Signals the loop and waits up to [`STOP_TIMEOUT`] before aborting it.
    /// A job already running on the blocking pool finishes on its own.
    pub async fn stop(&self) -> Result<bool, SchedulerError> {
        let taken = self
            .running
            .lock()
            .map_err(|_| SchedulerError::LockPoisoned)?
            .take();
        let Some(RunningLoop { cancel, mut handle }) = taken else {
            return Ok(false);
        };

        let _ = cancel.send(true);
        match tokio::time::timeout(STOP_TIMEOUT, &mut handle).await {
            Ok(_) => log_scheduler_state(self.source.name(), SchedulerState::Stopped, None),
            Err(_) => {
                handle.abort();
                log_scheduler_state(self.source.name(), SchedulerState::Aborted, None);
            }
        }
        Ok(true)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.as_ref().is_some_and(|r| !r.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Wakes the loop so it re-reads the job list.
    pub fn reschedule(&self) {
        self.reschedule.notify_one();
        log_scheduler_state(self.source.name(), SchedulerState::Rescheduled, self.next_run());
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        plan(self.source.as_ref(), Utc::now())
            .into_iter()
            .map(|(_, at)| at)
            .min()
    }

    /// Loops currently alive; at most one after any sequence of `start`.
    pub fn active_loops(&self) -> usize {
        self.active_loops.load(Ordering::SeqCst)
    }
}

struct LoopGuard(Arc<AtomicUsize>);

impl LoopGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_loop<S: JobSource>(
    source: Arc<S>,
    max_tick: Duration,
    reschedule: Arc<Notify>,
    mut cancelled: watch::Receiver<bool>,
    active_loops: Arc<AtomicUsize>,
) {
    let _guard = LoopGuard::enter(active_loops);
    let mut pending = plan(source.as_ref(), Utc::now());

    loop {
        if *cancelled.borrow() {
            break;
        }

        let now = Utc::now();
        let due: Vec<S::Job> = pending
            .iter()
            .filter(|(_, at)| *at <= now)
            .map(|(job, _)| *job)
            .collect();
        for job in due {
            debug!(component = source.name(), event = "scheduler.job.due", job = ?job);
            let runner = Arc::clone(&source);
            if let Err(err) = tokio::task::spawn_blocking(move || runner.run(job)).await {
                error!(
                    component = source.name(),
                    event = "scheduler.job.panicked",
                    job = ?job,
                    error = %err
                );
            }
            if *cancelled.borrow() {
                return;
            }
        }
        if pending.iter().any(|(_, at)| *at <= now) {
            pending = plan(source.as_ref(), Utc::now());
        }

        let wait = pending
            .iter()
            .map(|(_, at)| (*at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .min()
            .map_or(max_tick, |d| d.min(max_tick));

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = reschedule.notified() => {
                pending = plan(source.as_ref(), Utc::now());
            }
            changed = cancelled.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct Counter {
        runs: AtomicUsize,
        enabled: AtomicBool,
    }

    impl JobSource for Counter {
        type Job = ();

        fn name(&self) -> &'static str {
            "test_worker"
        }

        fn timezone(&self) -> Tz {
            Tz::UTC
        }

        fn jobs(&self) -> Vec<((), Schedule)> {
            if self.enabled.load(Ordering::SeqCst) {
                vec![((), Schedule::Every { minutes: 1 })]
            } else {
                Vec::new()
            }
        }

        fn run(&self, _job: ()) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counter(enabled: bool) -> Arc<Counter> {
        Arc::new(Counter {
            runs: AtomicUsize::new(0),
            enabled: AtomicBool::new(enabled),
        })
    }

    #[tokio::test]
    async fn start_twice_keeps_one_loop() {
        let worker = ScheduledWorker::new(counter(true));
        assert!(worker.start().expect("starts"));
        assert!(!worker.start().expect("second start is a no-op"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.active_loops(), 1);
        assert!(worker.is_running());

        assert!(worker.stop().await.expect("stops"));
        assert_eq!(worker.active_loops(), 0);
        assert!(!worker.is_running());
        assert!(!worker.stop().await.expect("stop when stopped"));
    }

    #[tokio::test]
    async fn disabled_source_has_no_next_run() {
        let source = counter(false);
        let worker = ScheduledWorker::new(Arc::clone(&source));
        assert_eq!(worker.next_run(), None);
        source.enabled.store(true, Ordering::SeqCst);
        assert!(worker.next_run().is_some());
    }

    #[test]
    fn start_outside_runtime_is_an_error() {
        let worker = ScheduledWorker::new(counter(true));
        assert!(matches!(worker.start(), Err(SchedulerError::NoRuntime)));
    }
}
