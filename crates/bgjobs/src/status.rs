//! Job lifecycle states and the views callers get on a scheduled job

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::event::JobListener;

/// Lifecycle state of a scheduled job
///
/// ```text
/// SCHEDULED -> STARTING -> RUNNING -> SUCCEEDED | FAILED
///     |            |          |
///     |            v          v
///     |   ABORTING_STARTING -> ABORTING -> ABORTED
///     +--------------------------------> ABORTED
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Queued, not started yet. Aborting now goes straight to `Aborted`.
    Scheduled,
    /// Execution thread is being created; it moves the job to `Running`
    /// right before calling the work function.
    Starting,
    /// The work function is executing
    Running,
    /// Aborted while starting. Resolved to `Aborting` once the execution
    /// thread reaches its checkpoint.
    AbortingStarting,
    /// Cancellation requested, the job has not returned yet
    Aborting,
    /// The job was aborted before it could complete its work
    Aborted,
    /// The work is complete
    Succeeded,
    /// The work function returned an error
    Failed,
}

impl State {
    /// No transition leaves a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted | Self::Succeeded | Self::Failed)
    }

    /// Cancellation was requested but the job has not finished yet
    pub fn is_aborting(&self) -> bool {
        matches!(self, Self::AbortingStarting | Self::Aborting)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Scheduled => "SCHEDULED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::AbortingStarting => "ABORTING_STARTING",
            Self::Aborting => "ABORTING",
            Self::Aborted => "ABORTED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Read-only view of a scheduled job
pub trait JobInfo: Send + Sync {
    fn state(&self) -> State;

    /// Units of work completed so far
    fn work_done(&self) -> u32;

    /// Expected total units of work, `0` when unknown
    fn work_total(&self) -> u32;

    /// Unique id assigned at submission
    fn id(&self) -> &str;

    fn description(&self) -> String;

    /// Type name of the submitted job
    fn job_type(&self) -> &'static str;

    /// When the job was submitted
    fn start_time(&self) -> DateTime<Utc>;

    /// Last time state or progress changed
    fn last_modified(&self) -> Option<DateTime<Utc>>;

    fn is_visible(&self) -> bool;
}

/// Control surface of a scheduled job, independent of its result type
pub trait JobControl: JobInfo {
    /// Request cancellation. Never blocks.
    fn abort(&self);

    /// Wait for the execution thread to terminate
    ///
    /// `None` waits indefinitely. Returns [`Error::Timeout`](crate::Error::Timeout)
    /// when a bounded wait expires first.
    fn join(&self, timeout: Option<Duration>) -> Result<()>;

    /// Whether the job honours cancellation once running
    fn is_cancellation_supported(&self) -> bool;

    fn add_job_listener(&self, listener: Arc<dyn JobListener>);

    fn remove_job_listener(&self, listener: &Arc<dyn JobListener>);
}

/// Typed handle of a scheduled job
pub trait JobStatus<T>: JobControl {
    /// Wait for completion and return the job's value
    ///
    /// Fails with [`Error::Failed`](crate::Error::Failed) if the job raised an
    /// error and with [`Error::Cancelled`](crate::Error::Cancelled) if it was aborted.
    fn result(&self) -> Result<Arc<T>>;

    /// Like [`result`](Self::result), giving up after `timeout`
    fn result_timeout(&self, timeout: Duration) -> Result<Arc<T>>;
}

/// Point-in-time copy of a job's observable state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub id: String,
    pub description: String,
    pub job_type: String,
    pub state: State,
    pub work_done: u32,
    pub work_total: u32,
    pub visible: bool,
    pub start_time: DateTime<Utc>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    pub fn of(job: &dyn JobInfo) -> Self {
        Self {
            id: job.id().to_string(),
            description: job.description(),
            job_type: job.job_type().to_string(),
            state: job.state(),
            work_done: job.work_done(),
            work_total: job.work_total(),
            visible: job.is_visible(),
            start_time: job.start_time(),
            last_modified: job.last_modified(),
        }
    }

    pub fn percent_complete(&self) -> f32 {
        if self.work_total == 0 {
            return 0.0;
        }

        let done = self.work_done.min(self.work_total) as f32;
        done / self.work_total as f32 * 100.0
    }
}
