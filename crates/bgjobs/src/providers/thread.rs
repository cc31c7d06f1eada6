//! Thread creation strategy for job execution

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Unit of execution run on a background thread
pub type ThreadTask = Box<dyn FnOnce() + Send + 'static>;

/// A thread that has been created but may not be running yet
#[cfg_attr(test, mockall::automock)]
pub trait BackgroundThread: Send + Sync {
    /// Start running the task. Starting twice is a no-op.
    fn start(&self) -> Result<()>;

    /// Wait for the task to finish
    ///
    /// Must be safe to call before `start`; it then waits for the thread to
    /// be started and finish. Returns `true` if the thread has terminated.
    fn join(&self, timeout: Option<Duration>) -> bool;
}

/// Creates the threads scheduled jobs execute on
#[cfg_attr(test, mockall::automock)]
pub trait ThreadFactory: Send + Sync {
    fn create_thread(&self, name: &str, task: ThreadTask) -> Box<dyn BackgroundThread>;
}

/// Spawns one named OS thread per job
#[derive(Debug, Default, Clone)]
pub struct NativeThreadFactory {
    /// Stack size for spawned threads, platform default when unset
    pub stack_size: Option<usize>,
}

impl NativeThreadFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stack_size(stack_size: usize) -> Self {
        Self {
            stack_size: Some(stack_size),
        }
    }
}

impl ThreadFactory for NativeThreadFactory {
    fn create_thread(&self, name: &str, task: ThreadTask) -> Box<dyn BackgroundThread> {
        Box::new(NativeThread {
            name: name.to_string(),
            stack_size: self.stack_size,
            slot: Mutex::new(Slot::Pending(task)),
            finished: Arc::new(Finished::default()),
        })
    }
}

enum Slot {
    Pending(ThreadTask),
    Running(JoinHandle<()>),
    Joined,
}

#[derive(Default)]
struct Finished {
    done: Mutex<bool>,
    signal: Condvar,
}

impl Finished {
    fn set(&self) {
        *self.done.lock() = true;
        self.signal.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut done = self.done.lock();
        while !*done {
            match deadline {
                Some(deadline) => {
                    if self.signal.wait_until(&mut done, deadline).timed_out() {
                        break;
                    }
                }
                None => self.signal.wait(&mut done),
            }
        }
        *done
    }
}

/// Marks the thread finished even if the task unwinds
struct FinishOnDrop(Arc<Finished>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.set();
    }
}

struct NativeThread {
    name: String,
    stack_size: Option<usize>,
    slot: Mutex<Slot>,
    finished: Arc<Finished>,
}

impl BackgroundThread for NativeThread {
    fn start(&self) -> Result<()> {
        let mut slot = self.slot.lock();
        let task = match std::mem::replace(&mut *slot, Slot::Joined) {
            Slot::Pending(task) => task,
            other => {
                *slot = other;
                return Ok(());
            }
        };

        let finished = Arc::clone(&self.finished);
        let mut builder = std::thread::Builder::new().name(self.name.clone());
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }

        match builder.spawn(move || {
            let _finished = FinishOnDrop(finished);
            task();
        }) {
            Ok(handle) => {
                *slot = Slot::Running(handle);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to spawn thread {}: {}", self.name, e);
                self.finished.set();
                Err(Error::ThreadStart(e.to_string()))
            }
        }
    }

    fn join(&self, timeout: Option<Duration>) -> bool {
        if !self.finished.wait(timeout) {
            return false;
        }

        let handle = match std::mem::replace(&mut *self.slot.lock(), Slot::Joined) {
            Slot::Running(handle) => Some(handle),
            _ => None,
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("Thread {} terminated by a panic", self.name);
            }
        }
        true
    }
}
