//! The job contract: units of work and the monitor they report through

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Log severity for messages emitted through a [`Monitor`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Feedback channel handed to a running job
///
/// Progress is measured in unitless "units of work". A total of `0` means
/// the amount of work is not known (yet).
pub trait Monitor: Send + Sync {
    /// Write to the job-specific log
    fn log(&self, severity: Severity, message: &str);

    /// Whether cancellation of this execution was requested
    ///
    /// Long-running jobs should poll this and return as soon as possible
    /// once it turns `true`.
    fn is_aborting(&self) -> bool;

    /// The id the scheduler assigned to this execution
    fn scheduled_job_id(&self) -> &str;

    /// Announce the total amount of work. May be called again to refine the estimate.
    fn announce_total(&self, total: u32);

    /// Report units of work completed since the last report
    fn report_progress_increment(&self, delta: u32);

    /// Report units of work completed since the execution started
    fn report_progress_absolute(&self, done: u32);

    /// Sleep for up to `timeout`, waking early when cancellation is requested
    ///
    /// Returns `true` if the job is aborting when the wait ends.
    fn wait_for_abort(&self, timeout: Duration) -> bool {
        if !self.is_aborting() {
            std::thread::sleep(timeout);
        }
        self.is_aborting()
    }

    fn info(&self, message: &str) {
        self.log(Severity::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(Severity::Warning, message);
    }

    fn error(&self, message: &str) {
        self.log(Severity::Error, message);
    }
}

/// A unit of background work
///
/// A job is executed at most once per submission. While executing it should
/// use the [`Monitor`] for progress, logging and cancellation polling.
pub trait Job: Send + Sync + 'static {
    /// Value produced by a successful execution
    type Output: Send + Sync + 'static;

    /// Execute the job
    ///
    /// Any error marks the execution as failed. If the job was aborted the
    /// returned value is discarded.
    fn work(&self, monitor: &dyn Monitor) -> anyhow::Result<Self::Output>;

    /// Human-readable description
    fn description(&self) -> String;

    /// Whether the job honours cancellation once it is running
    ///
    /// A job can always be cancelled while it is still scheduled.
    fn is_cancellation_supported(&self) -> bool {
        true
    }

    /// Whether the job should be shown to end users
    fn is_visible(&self) -> bool {
        true
    }
}

impl<J: Job + ?Sized> Job for Arc<J> {
    type Output = J::Output;

    fn work(&self, monitor: &dyn Monitor) -> anyhow::Result<Self::Output> {
        (**self).work(monitor)
    }

    fn description(&self) -> String {
        (**self).description()
    }

    fn is_cancellation_supported(&self) -> bool {
        (**self).is_cancellation_supported()
    }

    fn is_visible(&self) -> bool {
        (**self).is_visible()
    }
}

impl<J: Job + ?Sized> Job for Box<J> {
    type Output = J::Output;

    fn work(&self, monitor: &dyn Monitor) -> anyhow::Result<Self::Output> {
        (**self).work(monitor)
    }

    fn description(&self) -> String {
        (**self).description()
    }

    fn is_cancellation_supported(&self) -> bool {
        (**self).is_cancellation_supported()
    }

    fn is_visible(&self) -> bool {
        (**self).is_visible()
    }
}

/// Job built from a closure
///
/// ```ignore
/// let job = FnJob::new("count to three", |monitor| {
///     monitor.announce_total(3);
///     for _ in 0..3 {
///         monitor.report_progress_increment(1);
///     }
///     Ok(3)
/// });
/// ```
pub struct FnJob<F> {
    description: String,
    work: F,
    cancellation_supported: bool,
    visible: bool,
}

impl<F, T> FnJob<F>
where
    F: Fn(&dyn Monitor) -> anyhow::Result<T> + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub fn new(description: impl Into<String>, work: F) -> Self {
        Self {
            description: description.into(),
            work,
            cancellation_supported: true,
            visible: true,
        }
    }

    /// Mark the job as ignoring cancellation once running
    pub fn uncancellable(mut self) -> Self {
        self.cancellation_supported = false;
        self
    }

    /// Hide the job from end users
    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }
}

impl<F, T> Job for FnJob<F>
where
    F: Fn(&dyn Monitor) -> anyhow::Result<T> + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    type Output = T;

    fn work(&self, monitor: &dyn Monitor) -> anyhow::Result<T> {
        (self.work)(monitor)
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn is_cancellation_supported(&self) -> bool {
        self.cancellation_supported
    }

    fn is_visible(&self) -> bool {
        self.visible
    }
}
