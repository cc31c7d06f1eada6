//! bgjobs: In-process background job scheduler
//!
//! Jobs are submitted to a [`Scheduler`], which runs them one at a time in
//! FIFO order on dedicated threads. Each submission is tracked by a
//! [`ScheduledJob`] that exposes its lifecycle [`State`], progress,
//! cooperative cancellation and result, and notifies [`JobListener`]s of
//! every change. [`CompositeJob`] chains weighted steps into one job.
//!
//! ```ignore
//! use bgjobs::{FnJob, JobStatus, Scheduler};
//!
//! let scheduler = Scheduler::new();
//! scheduler.ensure_started()?;
//! let handle = scheduler.schedule(FnJob::new("answer", |_| Ok(42)));
//! assert_eq!(*handle.result()?, 42);
//! ```

pub mod cancel;
pub mod composite;
pub mod config;
pub mod decorator;
pub mod error;
pub mod event;
pub mod job;
pub mod providers;
pub mod scheduled;
pub mod scheduler;
pub mod status;

pub use cancel::CancellationToken;
pub use composite::{CompositeJob, CompositeOutput};
pub use config::{LogSinkKind, SchedulerConfig};
pub use decorator::StatusDecorator;
pub use error::{Error, Result};
pub use event::{JobEvent, JobListener};
pub use job::{FnJob, Job, Monitor, Severity};
pub use scheduled::{JobHandle, JobRuntime, ScheduledJob};
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerStats};
pub use status::{JobControl, JobInfo, JobSnapshot, JobStatus, State};
