//! # Scheduler - Policy-Driven Self-Rescheduling Tasks
//!
//! Every task registered with the [`Scheduler`] runs in its own tokio task. After each
//! run the task asks its [`ExecutePolicy`] for the next fire time and re-arms itself,
//! until the policy returns `None` or the task is cancelled.
//!
//! ## 🚀 Quick Start
//!
//! ```rust
//! use waterflow::scheduler::Scheduler;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> waterflow::FlowResult<()> {
//!     let scheduler = Scheduler::new();
//!
//!     scheduler.fixed_delay("heartbeat", Duration::from_millis(50), || async {
//!         Ok(())
//!     })?;
//!     scheduler.disposable("warmup", Duration::ZERO, || async { Ok(()) })?;
//!     scheduler.cron("report", "0 0 * * * *", || async { Ok(()) })?;
//!
//!     scheduler.trigger("heartbeat")?;
//!     scheduler.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## ⏱️ Clock Skew
//!
//! If the wall clock reads earlier than the task's last execute time, the task sleeps in
//! small steps and re-reads the clock (bounded by the skew guard's maximum wait) instead
//! of firing early or computing a negative delay.

use crate::error::{FlowError, FlowResult};
use crate::policy::{Clock, ExecutePolicy, Execution, SystemClock};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

/// Task status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Idle,
    Running,
    /// Last run failed; the task keeps its schedule.
    Failed(String),
    /// The policy produced no further fire time.
    Finished,
    Cancelled,
}

/// Snapshot of a scheduled task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub name: String,
    pub status: TaskStatus,
    pub run_count: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub execution: Execution,
}

/// Handle to a registered task.
#[derive(Clone)]
pub struct ScheduledTask {
    name: String,
    wake: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
    info: Arc<RwLock<TaskInfo>>,
}

impl ScheduledTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire now instead of waiting for the next planned time.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Stop re-arming. A run already in progress completes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> Option<TaskInfo> {
        self.info.read().ok().map(|info| info.clone())
    }
}

#[derive(Debug, Clone, Copy)]
struct SkewGuard {
    step: Duration,
    max_wait: Duration,
}

/// Policy-driven task scheduler
#[derive(Clone)]
pub struct Scheduler {
    tasks: Arc<Mutex<HashMap<String, ScheduledTask>>>,
    clock: Arc<dyn Clock>,
    skew: SkewGuard,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(SystemClock),
            skew: SkewGuard {
                step: Duration::from_millis(10),
                max_wait: Duration::from_secs(1),
            },
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Configure the clock-skew guard's recheck step and maximum wait.
    pub fn with_skew_guard(mut self, step: Duration, max_wait: Duration) -> Self {
        self.skew = SkewGuard { step, max_wait };
        self
    }

    /// Run `task` once after `delay`.
    pub fn disposable<F, Fut>(&self, name: &str, delay: Duration, task: F) -> FlowResult<ScheduledTask>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlowResult<()>> + Send + 'static,
    {
        self.schedule(name, ExecutePolicy::after(delay), task)
    }

    /// Run `task` now, then `delay` after each completion.
    pub fn fixed_delay<F, Fut>(&self, name: &str, delay: Duration, task: F) -> FlowResult<ScheduledTask>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlowResult<()>> + Send + 'static,
    {
        self.schedule(
            name,
            ExecutePolicy::fixed_delay(self.clock.now(), delay),
            task,
        )
    }

    /// Run `task` on a cron expression.
    pub fn cron<F, Fut>(&self, name: &str, expr: &str, task: F) -> FlowResult<ScheduledTask>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlowResult<()>> + Send + 'static,
    {
        let policy = ExecutePolicy::cron(self.clock.now(), expr)?;
        self.schedule(name, policy, task)
    }

    /// Register `task` under `name` with an arbitrary policy and start its timer.
    pub fn schedule<F, Fut>(
        &self,
        name: &str,
        policy: ExecutePolicy,
        task: F,
    ) -> FlowResult<ScheduledTask>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlowResult<()>> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| FlowError::scheduler(format!("no tokio runtime: {e}")))?;

        let handle = {
            let mut tasks = self
                .tasks
                .lock()
                .map_err(|_| FlowError::scheduler("Failed to acquire task table lock"))?;
            if tasks.contains_key(name) {
                return Err(FlowError::configuration(format!(
                    "Task '{name}' already exists"
                )));
            }
            let handle = ScheduledTask {
                name: name.to_string(),
                wake: Arc::new(Notify::new()),
                cancelled: Arc::new(AtomicBool::new(false)),
                info: Arc::new(RwLock::new(TaskInfo {
                    name: name.to_string(),
                    status: TaskStatus::Idle,
                    run_count: 0,
                    last_run: None,
                    next_run: None,
                    execution: Execution::new(),
                })),
            };
            tasks.insert(name.to_string(), handle.clone());
            handle
        };

        debug!(task = name, ?policy, "Scheduling task");
        runtime.spawn(drive(
            handle.clone(),
            policy,
            task,
            Arc::clone(&self.clock),
            self.skew,
            Arc::clone(&self.tasks),
        ));
        Ok(handle)
    }

    /// Wake a task immediately.
    pub fn trigger(&self, name: &str) -> FlowResult<()> {
        let tasks = self
            .tasks
            .lock()
            .map_err(|_| FlowError::scheduler("Failed to acquire task table lock"))?;
        let task = tasks
            .get(name)
            .ok_or_else(|| FlowError::scheduler(format!("Task '{name}' is not scheduled")))?;
        task.trigger();
        Ok(())
    }

    /// Cancel a task. Returns false when no such task is scheduled.
    pub fn cancel(&self, name: &str) -> bool {
        match self.tasks.lock() {
            Ok(tasks) => match tasks.get(name) {
                Some(task) => {
                    task.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Get task status
    pub fn status(&self, name: &str) -> Option<TaskInfo> {
        self.tasks.lock().ok()?.get(name).and_then(|t| t.info())
    }

    /// List all live tasks
    pub fn list(&self) -> Vec<TaskInfo> {
        match self.tasks.lock() {
            Ok(tasks) => tasks.values().filter_map(|t| t.info()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Number of tasks currently inside a run
    pub fn running_count(&self) -> usize {
        self.list()
            .iter()
            .filter(|info| info.status == TaskStatus::Running)
            .count()
    }

    /// Number of live tasks
    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every task and wait up to 30 seconds for them to wind down.
    pub async fn stop(&self) -> FlowResult<()> {
        self.stop_with_timeout(Duration::from_secs(30)).await
    }

    /// Cancel every task and wait for in-flight runs to finish.
    pub async fn stop_with_timeout(&self, timeout: Duration) -> FlowResult<()> {
        let handles: Vec<ScheduledTask> = {
            let tasks = self
                .tasks
                .lock()
                .map_err(|_| FlowError::scheduler("Failed to acquire task table lock"))?;
            tasks.values().cloned().collect()
        };
        for handle in &handles {
            handle.cancel();
        }

        let start_time = Instant::now();
        loop {
            if self.is_empty() {
                break;
            }
            if start_time.elapsed() >= timeout {
                return Err(FlowError::timeout(format!(
                    "Timeout after {timeout:?} waiting for {} scheduled tasks",
                    self.len()
                )));
            }
            sleep(Duration::from_millis(10)).await;
        }

        info!(stopped = handles.len(), "Scheduler stopped");
        Ok(())
    }
}

fn update(info: &RwLock<TaskInfo>, f: impl FnOnce(&mut TaskInfo)) {
    if let Ok(mut guard) = info.write() {
        f(&mut guard);
    }
}

fn execution_of(info: &RwLock<TaskInfo>) -> Execution {
    info.read()
        .map(|i| i.execution.clone())
        .unwrap_or_default()
}

/// Read the clock until it is no earlier than `last`, sleeping `step` between reads.
/// Gives up after `max_wait` and returns `last`.
async fn settle_clock(
    clock: &dyn Clock,
    last: Option<DateTime<Utc>>,
    step: Duration,
    max_wait: Duration,
) -> DateTime<Utc> {
    let mut now = clock.now();
    let Some(last) = last else {
        return now;
    };
    if now >= last {
        return now;
    }

    warn!(%now, %last, "Clock moved backwards, waiting for it to catch up");
    let started = Instant::now();
    while now < last && started.elapsed() < max_wait {
        sleep(step).await;
        now = clock.now();
    }
    if now < last { last } else { now }
}

async fn drive<F, Fut>(
    handle: ScheduledTask,
    policy: ExecutePolicy,
    task: F,
    clock: Arc<dyn Clock>,
    skew: SkewGuard,
    tasks: Arc<Mutex<HashMap<String, ScheduledTask>>>,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FlowResult<()>> + Send + 'static,
{
    let info = Arc::clone(&handle.info);

    let final_status = loop {
        if handle.is_cancelled() {
            break TaskStatus::Cancelled;
        }

        let execution = execution_of(&info);
        let next = match policy.next_execute_time(&execution) {
            Ok(Some(next)) => next,
            Ok(None) => break TaskStatus::Finished,
            Err(e) => break TaskStatus::Failed(e.to_string()),
        };

        let mut scheduled = execution;
        if let Err(e) = scheduled.mark_scheduled(next) {
            break TaskStatus::Failed(e.to_string());
        }
        update(&info, |i| {
            i.execution = scheduled;
            i.next_run = Some(next);
        });

        let wait = (next - clock.now()).to_std().unwrap_or(Duration::ZERO);
        if !wait.is_zero() {
            tokio::select! {
                _ = sleep(wait) => {}
                _ = handle.wake.notified() => {}
            }
        }
        if handle.is_cancelled() {
            break TaskStatus::Cancelled;
        }

        let mut execution = execution_of(&info);
        let started = settle_clock(
            clock.as_ref(),
            execution.last_complete_time,
            skew.step,
            skew.max_wait,
        )
        .await;
        if let Err(e) = execution.mark_executing(started) {
            break TaskStatus::Failed(e.to_string());
        }
        update(&info, |i| {
            i.execution = execution.clone();
            i.status = TaskStatus::Running;
            i.last_run = Some(started);
        });

        let result = task().await;

        let finished = settle_clock(clock.as_ref(), Some(started), skew.step, skew.max_wait).await;
        if let Err(e) = execution.mark_executed(finished) {
            break TaskStatus::Failed(e.to_string());
        }
        update(&info, |i| {
            i.execution = execution;
            i.run_count += 1;
            i.status = match &result {
                Ok(()) => TaskStatus::Idle,
                Err(e) => TaskStatus::Failed(e.to_string()),
            };
        });
        if let Err(e) = result {
            warn!(task = handle.name(), error = %e, "Scheduled task run failed");
        }
    };

    debug!(task = handle.name(), status = ?final_status, "Scheduled task ended");
    update(&info, |i| {
        i.status = final_status;
        i.next_run = None;
    });
    if let Ok(mut tasks) = tasks.lock() {
        // A task re-registered under the same name must not be evicted.
        if tasks
            .get(handle.name())
            .is_some_and(|t| Arc::ptr_eq(&t.cancelled, &handle.cancelled))
        {
            tasks.remove(handle.name());
        }
    }
}
