use chrono::Utc;
use log::{debug, info, warn};
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("a job is already scheduled")]
    AlreadyScheduled,

    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("a run is already in progress")]
    Busy,

    #[error("scheduler is stopped")]
    Stopped,
}

/// 调度器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

enum Trigger {
    Cron(cron::Schedule),
    Every(Duration),
}

impl Trigger {
    fn next_delay(&self) -> Option<Duration> {
        match self {
            Trigger::Cron(schedule) => {
                let next = schedule.upcoming(Utc).next()?;
                Some((next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            }
            Trigger::Every(period) => Some(*period),
        }
    }
}

/// Holds the run lock for one run; the state returns to Idle when dropped,
/// including when the run is cancelled or panics.
struct RunGuard {
    state: Arc<AtomicU8>,
    _lock: OwnedMutexGuard<()>,
}

impl RunGuard {
    fn enter(state: Arc<AtomicU8>, lock: OwnedMutexGuard<()>) -> Self {
        let _ = state.compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst);
        Self { state, _lock: lock }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let _ = self.state.compare_exchange(RUNNING, IDLE, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// Parses a cron expression. Five-field expressions get a leading seconds
/// field of `0`.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, SchedulerError> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    };

    cron::Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Runs one periodic job. Runs never overlap: a trigger that fires while the
/// previous run is still going is dropped.
pub struct Scheduler {
    state: Arc<AtomicU8>,
    run_lock: Arc<AsyncMutex<()>>,
    trigger: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(AtomicU8::new(IDLE)),
            run_lock: Arc::new(AsyncMutex::new(())),
            trigger: Mutex::new(None),
            shutdown,
        }
    }

    pub fn state(&self) -> SchedulerState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => SchedulerState::Running,
            STOPPED => SchedulerState::Stopped,
            _ => SchedulerState::Idle,
        }
    }

    /// Schedules `job` on a cron expression (5 or 6 fields, UTC).
    pub fn schedule<F, Fut>(&self, cron: &str, job: F) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let schedule = parse_cron(cron)?;
        self.install(Trigger::Cron(schedule), job)?;
        info!("Scheduled job with cron '{}'", cron);
        Ok(())
    }

    /// Schedules `job` at a fixed period.
    pub fn schedule_interval<F, Fut>(&self, period: Duration, job: F) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.install(Trigger::Every(period), job)
    }

    fn install<F, Fut>(&self, trigger: Trigger, job: F) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.state() == SchedulerState::Stopped {
            return Err(SchedulerError::Stopped);
        }

        let mut slot = self.trigger.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(SchedulerError::AlreadyScheduled);
        }

        let state = self.state.clone();
        let run_lock = self.run_lock.clone();
        let mut shutdown = self.shutdown.subscribe();

        *slot = Some(tokio::spawn(async move {
            loop {
                let delay = match trigger.next_delay() {
                    Some(delay) => delay,
                    None => {
                        warn!("Schedule has no further occurrences");
                        break;
                    }
                };

                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if *shutdown.borrow() {
                    break;
                }

                let guard = match run_lock.clone().try_lock_owned() {
                    Ok(lock) => RunGuard::enter(state.clone(), lock),
                    Err(_) => {
                        debug!("Previous run still in progress, skipping trigger");
                        continue;
                    }
                };

                let run = job();
                tokio::spawn(async move {
                    let _guard = guard;
                    run.await;
                });
            }

            debug!("Scheduler trigger stopped");
        }));

        Ok(())
    }

    /// Runs `fut` now under the same singleton guard as scheduled runs.
    pub async fn run_once<Fut>(&self, fut: Fut) -> Result<Fut::Output, SchedulerError>
    where
        Fut: Future,
    {
        if self.state() == SchedulerState::Stopped {
            return Err(SchedulerError::Stopped);
        }

        let lock = self.run_lock.clone().try_lock_owned().map_err(|_| SchedulerError::Busy)?;
        let _guard = RunGuard::enter(self.state.clone(), lock);
        Ok(fut.await)
    }

    /// Stops the trigger, then waits for an in-flight run to finish.
    pub async fn stop(&self) {
        self.state.store(STOPPED, Ordering::SeqCst);
        let _ = self.shutdown.send(true);

        let trigger = self.trigger.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(trigger) = trigger {
            let _ = trigger.await;
        }

        // 等待正在进行的运行结束
        let _ = self.run_lock.lock().await;
        info!("Scheduler stopped");
    }
}
