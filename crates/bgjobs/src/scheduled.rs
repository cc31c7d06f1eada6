//! A submitted job, its lifecycle state machine and its execution
//!
//! A [`ScheduledJob`] wraps exactly one [`Job`] and runs it at most once on a
//! dedicated thread. State changes and progress reports are published to
//! registered [`JobListener`]s in the order they happened, and the call that
//! raised an event returns only after every listener has seen it.

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::event::{same_listener, JobEvent, JobListener};
use crate::job::{Job, Monitor, Severity};
use crate::providers::{
    BackgroundThread, ExecutionUnit, ExecutionUnitFactory, LogSink, LogSinkFactory,
    NativeThreadFactory, OnceUnitFactory, StderrLogSinkFactory, ThreadFactory,
};
use crate::status::{JobControl, JobInfo, JobStatus, State};

/// Shared handle to a scheduled job
pub type JobHandle<T> = Arc<ScheduledJob<T>>;

type WorkFn<T> = Box<dyn FnOnce(&dyn Monitor) -> anyhow::Result<T> + Send + 'static>;

type PanicPayload = Box<dyn Any + Send + 'static>;

/// Collaborators a scheduled job executes with
#[derive(Clone)]
pub struct JobRuntime {
    pub execution_unit_factory: Arc<dyn ExecutionUnitFactory>,
    pub thread_factory: Arc<dyn ThreadFactory>,
    pub log_sink_factory: Arc<dyn LogSinkFactory>,
    /// Execution threads are named `{thread_prefix}-{id}`
    pub thread_prefix: String,
}

impl JobRuntime {
    /// Name of the thread executing job `id`
    pub fn thread_name(&self, id: &str) -> String {
        format!("{}-{}", self.thread_prefix, id)
    }
}

impl Default for JobRuntime {
    fn default() -> Self {
        Self {
            execution_unit_factory: Arc::new(OnceUnitFactory),
            thread_factory: Arc::new(NativeThreadFactory::new()),
            log_sink_factory: Arc::new(StderrLogSinkFactory),
            thread_prefix: "bgjobs-job".to_string(),
        }
    }
}

impl std::fmt::Debug for JobRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRuntime")
            .field("thread_prefix", &self.thread_prefix)
            .finish_non_exhaustive()
    }
}

enum Outcome<T> {
    Value(Arc<T>),
    Failed(Arc<anyhow::Error>),
    Cancelled,
}

/// Everything guarded by the job lock
struct Core<T> {
    state: State,
    work_done: u32,
    work_total: u32,
    last_modified: Option<DateTime<Utc>>,
    outcome: Option<Outcome<T>>,
    /// Events not yet delivered, in the order they were raised
    pending_events: VecDeque<JobEvent>,
    /// Number of events ever queued
    raised: u64,
    /// Number of events every listener has been called with
    delivered: u64,
    /// Thread currently delivering `pending_events`
    dispatcher: Option<ThreadId>,
}

/// Lifecycle wrapper around one submitted job
pub struct ScheduledJob<T> {
    id: String,
    description: String,
    job_type: &'static str,
    visible: bool,
    cancellation_supported: bool,
    start_time: DateTime<Utc>,
    this: Weak<ScheduledJob<T>>,
    core: Mutex<Core<T>>,
    outcome_ready: Condvar,
    /// Signalled whenever `Core::delivered` grows or the dispatcher leaves
    delivery: Condvar,
    listeners: Mutex<Vec<Arc<dyn JobListener>>>,
    token: CancellationToken,
    /// The execution body; withdrawn by an abort before execution
    unit: Arc<dyn ExecutionUnit>,
    thread: Mutex<Option<Box<dyn BackgroundThread>>>,
    runtime: JobRuntime,
    /// Dropped when execution is over; receivers see a disconnect
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
}

impl<T: Send + Sync + 'static> ScheduledJob<T> {
    /// Wrap `job` under the given id. Nothing runs until [`execute`](Self::execute).
    pub fn new<J>(id: impl Into<String>, job: J, runtime: JobRuntime) -> JobHandle<T>
    where
        J: Job<Output = T>,
    {
        let id = id.into();
        let description = job.description();
        let visible = job.is_visible();
        let cancellation_supported = job.is_cancellation_supported();
        let work: WorkFn<T> = Box::new(move |monitor: &dyn Monitor| job.work(monitor));
        let (done_tx, done_rx) = channel::bounded(0);

        Arc::new_cyclic(|this: &Weak<Self>| {
            let body = this.clone();
            let unit = runtime.execution_unit_factory.create_unit(Box::new(move || {
                if let Some(scheduled) = body.upgrade() {
                    scheduled.run(work);
                }
            }));

            Self {
                id,
                description,
                job_type: std::any::type_name::<J>(),
                visible,
                cancellation_supported,
                start_time: Utc::now(),
                this: this.clone(),
                core: Mutex::new(Core {
                    state: State::Scheduled,
                    work_done: 0,
                    work_total: 0,
                    last_modified: None,
                    outcome: None,
                    pending_events: VecDeque::new(),
                    raised: 0,
                    delivered: 0,
                    dispatcher: None,
                }),
                outcome_ready: Condvar::new(),
                delivery: Condvar::new(),
                listeners: Mutex::new(Vec::new()),
                token: CancellationToken::new(),
                unit,
                thread: Mutex::new(None),
                runtime,
                done_tx: Mutex::new(Some(done_tx)),
                done_rx,
            }
        })
    }

    /// Move to `STARTING` and hand the job to a new execution thread
    ///
    /// Does nothing if the job was aborted before this call or has already
    /// been executed. A panic raised by a listener or a provider fails the
    /// job, reaches the remaining listeners and is then rethrown.
    pub fn execute(&self) {
        {
            let mut core = self.core.lock();
            if core.state != State::Scheduled {
                return;
            }
            self.transition(&mut core, State::Starting);
        }

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.start_thread())) {
            self.abandon(&*payload);
            self.release_joiners();
            panic::resume_unwind(payload);
        }
    }

    fn start_thread(&self) {
        self.publish();

        let unit = Arc::clone(&self.unit);
        let thread = self.runtime.thread_factory.create_thread(
            &self.runtime.thread_name(&self.id),
            Box::new(move || unit.run()),
        );

        let started = {
            let mut slot = self.thread.lock();
            slot.insert(thread).start()
        };
        if let Err(e) = started {
            tracing::error!("Job {} could not be started: {}", self.id, e);
            self.fail_to_start(e);
        }
    }

    /// Body of the execution thread
    fn run(&self, work: WorkFn<T>) {
        let _release = ReleaseJoiners(self);

        let mut sink: Option<Box<dyn LogSink>> = None;
        let executed = panic::catch_unwind(AssertUnwindSafe(|| {
            let sink = sink.insert(self.runtime.log_sink_factory.create_log_sink(&self.id));
            self.run_with(work, &**sink);
        }));

        if let Err(payload) = &executed {
            self.abandon(&**payload);
        }
        if let Some(sink) = sink {
            sink.close();
        }
        if let Err(payload) = executed {
            panic::resume_unwind(payload);
        }
    }

    fn run_with(&self, work: WorkFn<T>, sink: &dyn LogSink) {
        // Resolve a cancellation requested while STARTING exactly once,
        // atomically with concurrent abort() calls.
        let proceed = {
            let mut core = self.core.lock();
            match core.state {
                State::Starting => {
                    self.transition(&mut core, State::Running);
                    true
                }
                State::AbortingStarting => {
                    self.transition(&mut core, State::Aborting);
                    self.token.cancel();
                    false
                }
                other => {
                    tracing::warn!("Job {} reached its start checkpoint in state {}", self.id, other);
                    false
                }
            }
        };
        self.publish();

        if proceed {
            let monitor = JobMonitor { job: self, sink };
            let result = match panic::catch_unwind(AssertUnwindSafe(|| work(&monitor))) {
                Ok(result) => result,
                Err(payload) => Err(anyhow::anyhow!("job panicked: {}", panic_message(&*payload))),
            };
            if let Err(e) = &result {
                monitor.log(Severity::Error, &format!("Job raised an uncaught error: {:?}", e));
            }
            self.finish(result);
        } else {
            sink.log(Severity::Info, "Job aborted before it started");
            self.finish_aborted();
        }
    }

    fn finish(&self, result: anyhow::Result<T>) {
        {
            let mut core = self.core.lock();
            match result {
                Ok(value) => {
                    if core.state == State::Aborting {
                        self.transition(&mut core, State::Aborted);
                        core.outcome = Some(Outcome::Cancelled);
                    } else {
                        self.transition(&mut core, State::Succeeded);
                        core.outcome = Some(Outcome::Value(Arc::new(value)));
                    }
                }
                Err(e) => {
                    self.transition(&mut core, State::Failed);
                    core.outcome = Some(Outcome::Failed(Arc::new(e)));
                }
            }
            self.outcome_ready.notify_all();
        }
        self.publish();
    }

    fn finish_aborted(&self) {
        {
            let mut core = self.core.lock();
            self.transition(&mut core, State::Aborted);
            core.outcome = Some(Outcome::Cancelled);
            self.outcome_ready.notify_all();
        }
        self.publish();
    }

    fn fail_to_start(&self, error: Error) {
        {
            let mut core = self.core.lock();
            if core.state.is_terminal() {
                return;
            }
            self.transition(&mut core, State::Failed);
            core.outcome = Some(Outcome::Failed(Arc::new(anyhow::Error::new(error))));
            self.outcome_ready.notify_all();
        }
        self.unit.cancel();
        self.publish();
        self.release_joiners();
    }

    /// Fail the job after a panic outside the job's own work
    ///
    /// Delivers the resulting events without rethrowing listener panics.
    fn abandon(&self, payload: &(dyn Any + Send)) {
        let message = panic_message(payload);
        tracing::error!("Job {} abandoned after a panic: {}", self.id, message);
        {
            let mut core = self.core.lock();
            if core.outcome.is_none() {
                self.transition(&mut core, State::Failed);
                core.outcome = Some(Outcome::Failed(Arc::new(anyhow::anyhow!(
                    "panicked outside the job: {}",
                    message
                ))));
                self.outcome_ready.notify_all();
            }
        }
        self.unit.cancel();
        // Already logged by the dispatcher.
        let _ = self.notify();
    }

    /// Completion latch: disconnects once execution is over
    pub(crate) fn completion(&self) -> Receiver<()> {
        self.done_rx.clone()
    }

    /// Apply a state change and queue its event. Caller holds the job lock.
    fn transition(&self, core: &mut Core<T>, new_state: State) {
        let old_state = core.state;
        if old_state == new_state {
            return;
        }
        core.state = new_state;
        core.last_modified = Some(Utc::now());
        self.raise(core, old_state, new_state);
    }

    fn update_progress(&self, update: impl FnOnce(&mut Core<T>)) {
        {
            let mut core = self.core.lock();
            update(&mut core);
            core.last_modified = Some(Utc::now());
            let state = core.state;
            self.raise(&mut core, state, state);
        }
        self.publish();
    }

    fn raise(&self, core: &mut Core<T>, old_state: State, new_state: State) {
        let Some(source) = self.this.upgrade() else {
            return;
        };
        let source: Arc<dyn JobInfo> = source;
        let event = JobEvent::new(source, old_state, new_state, core.work_done, core.work_total);
        core.pending_events.push_back(event);
        core.raised += 1;
    }

    /// Deliver queued events, rethrowing a listener panic once every
    /// listener has been served
    fn publish(&self) {
        if let Some(payload) = self.notify() {
            panic::resume_unwind(payload);
        }
    }

    /// Return once every event raised so far has reached all listeners
    ///
    /// Delivers the events itself unless another thread already does, in
    /// which case it waits for that thread. A thread that is delivering
    /// further up its own stack returns immediately. Yields the first
    /// listener panic caught by this thread.
    fn notify(&self) -> Option<PanicPayload> {
        let me = thread::current().id();
        let mut first_panic = None;
        let mut core = self.core.lock();
        let target = core.raised;
        loop {
            if core.delivered >= target || core.dispatcher == Some(me) {
                return first_panic;
            }
            if core.dispatcher.is_some() {
                self.delivery.wait(&mut core);
                continue;
            }

            core.dispatcher = Some(me);
            drop(core);
            let panicked = self.dispatch();
            if first_panic.is_none() {
                first_panic = panicked;
            }
            core = self.core.lock();
        }
    }

    /// Deliver queued events until none is left. Caller holds the dispatcher role.
    ///
    /// Every listener is called for every event, even after another
    /// listener panicked.
    fn dispatch(&self) -> Option<PanicPayload> {
        let mut guard = DispatchGuard {
            job: self,
            armed: true,
        };
        let mut first_panic = None;
        loop {
            let event = {
                let mut core = self.core.lock();
                match core.pending_events.pop_front() {
                    Some(event) => event,
                    None => {
                        core.dispatcher = None;
                        guard.armed = false;
                        self.delivery.notify_all();
                        return first_panic;
                    }
                }
            };

            let listeners = self.listeners.lock().clone();
            for listener in &listeners {
                let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                    if event.is_progress_update() {
                        listener.progress_updated(&event);
                    } else {
                        listener.state_changed(&event);
                    }
                }));
                if let Err(payload) = delivered {
                    tracing::error!(
                        "Listener of job {} panicked on {} -> {}: {}",
                        self.id,
                        event.old_state(),
                        event.new_state(),
                        panic_message(&*payload)
                    );
                    if first_panic.is_none() {
                        first_panic = Some(payload);
                    }
                }
            }

            self.core.lock().delivered += 1;
            self.delivery.notify_all();
        }
    }
}

impl<T> ScheduledJob<T> {
    fn release_joiners(&self) {
        self.done_tx.lock().take();
    }
}

/// Releases the dispatcher role if delivery unwinds
struct DispatchGuard<'a, T> {
    job: &'a ScheduledJob<T>,
    armed: bool,
}

impl<T> Drop for DispatchGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.job.core.lock().dispatcher = None;
            self.job.delivery.notify_all();
        }
    }
}

/// Wakes joiners when the execution thread exits, however it exits
struct ReleaseJoiners<'a, T>(&'a ScheduledJob<T>);

impl<T> Drop for ReleaseJoiners<'_, T> {
    fn drop(&mut self) {
        self.0.release_joiners();
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The monitor handed to a running job
struct JobMonitor<'a, T> {
    job: &'a ScheduledJob<T>,
    sink: &'a dyn LogSink,
}

impl<T: Send + Sync + 'static> Monitor for JobMonitor<'_, T> {
    fn log(&self, severity: Severity, message: &str) {
        self.sink.log(severity, message);
    }

    fn is_aborting(&self) -> bool {
        self.job.token.is_cancelled()
    }

    fn scheduled_job_id(&self) -> &str {
        &self.job.id
    }

    fn announce_total(&self, total: u32) {
        self.job.update_progress(|core| core.work_total = total);
    }

    fn report_progress_increment(&self, delta: u32) {
        self.job
            .update_progress(|core| core.work_done = core.work_done.saturating_add(delta));
    }

    fn report_progress_absolute(&self, done: u32) {
        self.job.update_progress(|core| core.work_done = done);
    }

    fn wait_for_abort(&self, timeout: Duration) -> bool {
        self.job.token.wait_timeout(timeout)
    }
}

impl<T: Send + Sync + 'static> JobInfo for ScheduledJob<T> {
    fn state(&self) -> State {
        self.core.lock().state
    }

    fn work_done(&self) -> u32 {
        self.core.lock().work_done
    }

    fn work_total(&self) -> u32 {
        self.core.lock().work_total
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn job_type(&self) -> &'static str {
        self.job_type
    }

    fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.core.lock().last_modified
    }

    fn is_visible(&self) -> bool {
        self.visible
    }
}

impl<T: Send + Sync + 'static> JobControl for ScheduledJob<T> {
    fn abort(&self) {
        let aborted_before_start = {
            let mut core = self.core.lock();
            match core.state {
                State::Scheduled => {
                    self.transition(&mut core, State::Aborted);
                    core.outcome = Some(Outcome::Cancelled);
                    self.outcome_ready.notify_all();
                    self.token.cancel();
                    true
                }
                // The thread may not exist yet; the start checkpoint resolves this.
                State::Starting => {
                    self.transition(&mut core, State::AbortingStarting);
                    false
                }
                State::Running | State::Aborting => {
                    self.transition(&mut core, State::Aborting);
                    self.token.cancel();
                    false
                }
                State::AbortingStarting | State::Aborted | State::Succeeded | State::Failed => {
                    false
                }
            }
        };

        if aborted_before_start {
            // Withdraw the pending execution so no thread is ever created.
            self.unit.cancel();
            self.release_joiners();
        }
        self.publish();
    }

    fn join(&self, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            None => {
                // Nothing is ever sent; recv returns once the sender is dropped.
                let _ = self.done_rx.recv();
            }
            Some(timeout) => {
                if let Err(RecvTimeoutError::Timeout) = self.done_rx.recv_timeout(timeout) {
                    return Err(Error::timeout(&self.id, timeout));
                }
            }
        }

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            thread.join(None);
        }
        Ok(())
    }

    fn is_cancellation_supported(&self) -> bool {
        self.cancellation_supported
    }

    fn add_job_listener(&self, listener: Arc<dyn JobListener>) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    fn remove_job_listener(&self, listener: &Arc<dyn JobListener>) {
        self.listeners.lock().retain(|l| !same_listener(l, listener));
    }
}

impl<T: Send + Sync + 'static> JobStatus<T> for ScheduledJob<T> {
    fn result(&self) -> Result<Arc<T>> {
        self.wait_for_outcome(None)
    }

    fn result_timeout(&self, timeout: Duration) -> Result<Arc<T>> {
        self.wait_for_outcome(Some(timeout))
    }
}

impl<T: Send + Sync + 'static> ScheduledJob<T> {
    fn wait_for_outcome(&self, timeout: Option<Duration>) -> Result<Arc<T>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut core = self.core.lock();
        loop {
            match &core.outcome {
                Some(Outcome::Value(value)) => return Ok(Arc::clone(value)),
                Some(Outcome::Failed(cause)) => return Err(Error::failed(&self.id, Arc::clone(cause))),
                Some(Outcome::Cancelled) => return Err(Error::cancelled(&self.id)),
                None => {}
            }

            match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    if self.outcome_ready.wait_until(&mut core, deadline).timed_out()
                        && core.outcome.is_none()
                    {
                        return Err(Error::timeout(&self.id, timeout));
                    }
                }
                _ => self.outcome_ready.wait(&mut core),
            }
        }
    }
}

impl<T> std::fmt::Debug for ScheduledJob<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("state", &self.core.lock().state)
            .finish()
    }
}

/// Type-erased execution surface used by the scheduler's queue
pub(crate) trait Executable: Send + Sync {
    fn job_id(&self) -> &str;
    fn execute(&self);
    fn abort_job(&self);
    fn completion(&self) -> Receiver<()>;
}

impl<T: Send + Sync + 'static> Executable for ScheduledJob<T> {
    fn job_id(&self) -> &str {
        &self.id
    }

    fn execute(&self) {
        ScheduledJob::execute(self);
    }

    fn abort_job(&self) {
        JobControl::abort(self);
    }

    fn completion(&self) -> Receiver<()> {
        ScheduledJob::completion(self)
    }
}
