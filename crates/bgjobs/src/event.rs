//! Job events and listeners

use std::sync::Arc;

use crate::status::{JobInfo, State};

/// A state transition or progress update of one scheduled job
///
/// Progress figures are captured when the event is created, so they match
/// the transition even if the job has moved on by the time a listener runs.
#[derive(Clone)]
pub struct JobEvent {
    source: Arc<dyn JobInfo>,
    old_state: State,
    new_state: State,
    work_done: u32,
    work_total: u32,
}

impl JobEvent {
    pub(crate) fn new(
        source: Arc<dyn JobInfo>,
        old_state: State,
        new_state: State,
        work_done: u32,
        work_total: u32,
    ) -> Self {
        Self {
            source,
            old_state,
            new_state,
            work_done,
            work_total,
        }
    }

    /// The job that emitted this event
    pub fn source(&self) -> &Arc<dyn JobInfo> {
        &self.source
    }

    pub fn job_id(&self) -> &str {
        self.source.id()
    }

    pub fn old_state(&self) -> State {
        self.old_state
    }

    pub fn new_state(&self) -> State {
        self.new_state
    }

    pub fn work_done(&self) -> u32 {
        self.work_done
    }

    pub fn work_total(&self) -> u32 {
        self.work_total
    }

    /// Progress updates carry the same old and new state
    pub fn is_progress_update(&self) -> bool {
        self.old_state == self.new_state
    }
}

impl std::fmt::Debug for JobEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEvent")
            .field("job_id", &self.job_id())
            .field("old_state", &self.old_state)
            .field("new_state", &self.new_state)
            .field("work_done", &self.work_done)
            .field("work_total", &self.work_total)
            .finish()
    }
}

/// Observer of a scheduled job
///
/// Callbacks run on whichever thread caused the change, never while the
/// job's lock is held. A listener may add or remove listeners, or abort the
/// job, from inside a callback.
pub trait JobListener: Send + Sync {
    /// Called for every state transition
    fn state_changed(&self, event: &JobEvent);

    /// Called for every progress report
    fn progress_updated(&self, _event: &JobEvent) {}
}

/// Pointer identity used for idempotent listener registration
pub(crate) fn same_listener(a: &Arc<dyn JobListener>, b: &Arc<dyn JobListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
