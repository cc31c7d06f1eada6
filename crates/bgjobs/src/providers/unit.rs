//! Execution units: the cancellable body a job thread runs

use parking_lot::Mutex;
use std::sync::Arc;

use super::thread::ThreadTask;

/// A task that runs at most once and can be withdrawn before it starts
#[cfg_attr(test, mockall::automock)]
pub trait ExecutionUnit: Send + Sync {
    /// Run the task on the calling thread
    ///
    /// Does nothing if the unit was cancelled or has already run.
    fn run(&self);

    /// Withdraw the task if it has not started yet
    ///
    /// Returns `true` if the task will never run because of this call.
    fn cancel(&self) -> bool;
}

/// Wraps a job's execution body into an [`ExecutionUnit`]
#[cfg_attr(test, mockall::automock)]
pub trait ExecutionUnitFactory: Send + Sync {
    fn create_unit(&self, task: ThreadTask) -> Arc<dyn ExecutionUnit>;
}

/// Creates [`OnceUnit`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct OnceUnitFactory;

impl ExecutionUnitFactory for OnceUnitFactory {
    fn create_unit(&self, task: ThreadTask) -> Arc<dyn ExecutionUnit> {
        Arc::new(OnceUnit::new(task))
    }
}

enum UnitState {
    Pending(ThreadTask),
    Started,
    Cancelled,
}

/// Runs its task on the first `run` call unless cancelled before
pub struct OnceUnit {
    state: Mutex<UnitState>,
}

impl OnceUnit {
    pub fn new(task: ThreadTask) -> Self {
        Self {
            state: Mutex::new(UnitState::Pending(task)),
        }
    }
}

impl ExecutionUnit for OnceUnit {
    fn run(&self) {
        let task = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, UnitState::Started) {
                UnitState::Pending(task) => task,
                other => {
                    *state = other;
                    return;
                }
            }
        };
        task();
    }

    fn cancel(&self) -> bool {
        let withdrawn = {
            let mut state = self.state.lock();
            if !matches!(*state, UnitState::Pending(_)) {
                return false;
            }
            std::mem::replace(&mut *state, UnitState::Cancelled)
        };
        // Drop the task outside the lock
        drop(withdrawn);
        true
    }
}

impl std::fmt::Debug for OnceUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.state.lock() {
            UnitState::Pending(_) => "pending",
            UnitState::Started => "started",
            UnitState::Cancelled => "cancelled",
        };
        f.debug_struct("OnceUnit").field("state", &state).finish()
    }
}
