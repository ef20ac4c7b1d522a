//! # Execute Policies - When Does a Task Fire Next?
//!
//! An [`ExecutePolicy`] turns a task's own [`Execution`] timeline into the next fire time.
//! The [`crate::scheduler::Scheduler`] asks the policy after every run and re-arms the
//! timer until the policy answers `None` or the task is cancelled.
//!
//! | Policy | First fire | Following fires |
//! |--------|------------|-----------------|
//! | `Disposable` | `start` | never |
//! | `FixedDelay` | `start` | `last_complete_time + delay` |
//! | `Cron` | first match at or after `start` | first match after the last completion |

use crate::error::{FlowError, FlowResult};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Source of wall-clock time. Swappable so tests can move time backwards.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Position of a scheduled task in its own run cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Scheduling,
    Scheduled,
    Executing,
    Executed,
}

/// Timeline of one scheduled task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub status: ExecutionStatus,
    pub last_scheduled_time: Option<DateTime<Utc>>,
    pub last_execute_time: Option<DateTime<Utc>>,
    pub last_complete_time: Option<DateTime<Utc>>,
}

impl Default for Execution {
    fn default() -> Self {
        Self::new()
    }
}

impl Execution {
    pub fn new() -> Self {
        Self {
            status: ExecutionStatus::Scheduling,
            last_scheduled_time: None,
            last_execute_time: None,
            last_complete_time: None,
        }
    }

    /// Record the next planned fire time. Allowed on a fresh or a finished cycle.
    pub fn mark_scheduled(&mut self, at: DateTime<Utc>) -> FlowResult<()> {
        match self.status {
            ExecutionStatus::Scheduling | ExecutionStatus::Executed => {
                self.status = ExecutionStatus::Scheduled;
                self.last_scheduled_time = Some(at);
                Ok(())
            }
            other => Err(FlowError::invalid_execution(format!(
                "cannot schedule from {other:?}"
            ))),
        }
    }

    pub fn mark_executing(&mut self, at: DateTime<Utc>) -> FlowResult<()> {
        if self.status != ExecutionStatus::Scheduled {
            return Err(FlowError::invalid_execution(format!(
                "cannot execute from {:?}",
                self.status
            )));
        }
        if let Some(previous) = self.last_complete_time {
            if at < previous {
                return Err(FlowError::invalid_execution(format!(
                    "execute time {at} precedes last completion {previous}"
                )));
            }
        }
        self.status = ExecutionStatus::Executing;
        self.last_execute_time = Some(at);
        Ok(())
    }

    pub fn mark_executed(&mut self, at: DateTime<Utc>) -> FlowResult<()> {
        if self.status != ExecutionStatus::Executing {
            return Err(FlowError::invalid_execution(format!(
                "cannot complete from {:?}",
                self.status
            )));
        }
        if let Some(started) = self.last_execute_time {
            if at < started {
                return Err(FlowError::invalid_execution(format!(
                    "complete time {at} precedes execute time {started}"
                )));
            }
        }
        self.status = ExecutionStatus::Executed;
        self.last_complete_time = Some(at);
        Ok(())
    }
}

/// Firing rule for a scheduled task.
#[derive(Debug, Clone)]
pub enum ExecutePolicy {
    /// Fire once at `start`.
    Disposable { start: DateTime<Utc> },
    /// Fire at `start`, then `delay` after each completion.
    FixedDelay {
        start: DateTime<Utc>,
        delay: Duration,
    },
    /// Fire on a cron expression, not before `start`.
    Cron {
        start: DateTime<Utc>,
        expression: String,
        schedule: Box<CronSchedule>,
    },
}

impl ExecutePolicy {
    pub fn disposable(start: DateTime<Utc>) -> Self {
        Self::Disposable { start }
    }

    /// Fire once as soon as possible.
    pub fn immediate() -> Self {
        Self::Disposable { start: Utc::now() }
    }

    /// Fire once after `delay`.
    pub fn after(delay: Duration) -> Self {
        let offset = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        Self::Disposable {
            start: Utc::now() + offset,
        }
    }

    pub fn fixed_delay(start: DateTime<Utc>, delay: Duration) -> Self {
        Self::FixedDelay { start, delay }
    }

    pub fn cron(start: DateTime<Utc>, expression: &str) -> FlowResult<Self> {
        let schedule = CronSchedule::from_str(expression).map_err(|e| {
            FlowError::configuration(format!("Invalid cron expression '{expression}': {e}"))
        })?;
        Ok(Self::Cron {
            start,
            expression: expression.to_string(),
            schedule: Box::new(schedule),
        })
    }

    pub fn start(&self) -> DateTime<Utc> {
        match self {
            Self::Disposable { start }
            | Self::FixedDelay { start, .. }
            | Self::Cron { start, .. } => *start,
        }
    }

    /// Next fire time for `execution`, or `None` when the task is done.
    pub fn next_execute_time(&self, execution: &Execution) -> FlowResult<Option<DateTime<Utc>>> {
        match self {
            Self::Disposable { start } => {
                if execution.status == ExecutionStatus::Executed
                    || execution.last_execute_time.is_some()
                {
                    Ok(None)
                } else {
                    Ok(Some(*start))
                }
            }
            Self::FixedDelay { start, delay } => {
                if execution.last_execute_time.is_none() {
                    return Ok(Some(*start));
                }
                let complete = execution.last_complete_time.ok_or_else(|| {
                    FlowError::invalid_execution("fixed delay re-arm without a completion time")
                })?;
                if complete < *start {
                    return Err(FlowError::invalid_execution(format!(
                        "completion {complete} precedes start {start}"
                    )));
                }
                let delay = chrono::Duration::from_std(*delay)
                    .map_err(|e| FlowError::configuration(format!("delay out of range: {e}")))?;
                Ok(Some(complete + delay))
            }
            Self::Cron {
                start, schedule, ..
            } => {
                let base = match execution.last_complete_time {
                    Some(complete) if complete > *start => complete,
                    Some(_) => *start,
                    // `after` is exclusive; step back so a match exactly at `start` counts.
                    None => *start - chrono::Duration::seconds(1),
                };
                Ok(schedule.after(&base).next())
            }
        }
    }
}
