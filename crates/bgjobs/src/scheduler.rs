//! Single-worker FIFO job scheduler
//!
//! Submitted jobs are queued and executed strictly one at a time, in
//! submission order, by a dedicated worker thread. A bounded window of
//! recently started jobs stays queryable after they finish.

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::event::{JobEvent, JobListener};
use crate::job::Job;
use crate::providers::{
    ExecutionUnitFactory, IdGenerator, LogSinkFactory, OnceUnitFactory, ThreadFactory,
    UuidGenerator,
};
use crate::scheduled::{panic_message, Executable, JobHandle, JobRuntime, ScheduledJob};
use crate::status::{JobControl, State};

/// One submission waiting in the FIFO
///
/// Both handles point at the same scheduled job.
struct QueueEntry {
    control: Arc<dyn JobControl>,
    exec: Arc<dyn Executable>,
}

/// Outcome of one scheduling step
enum Step {
    /// The entry belonged to a job aborted while queued
    Skipped,
    Finished,
    /// Shutdown was requested while the job was running
    Interrupted,
}

/// Bookkeeping guarded by the scheduler lock
struct SchedulerState {
    /// Jobs waiting for execution, in submission order
    queued: VecDeque<Arc<dyn JobControl>>,
    /// Job currently handed to the worker
    running: Option<Arc<dyn JobControl>>,
    jobs: HashMap<String, Arc<dyn JobControl>>,
    /// Insertion order of `jobs`
    order: VecDeque<String>,
    /// Ids of jobs that left `SCHEDULED`, oldest first
    aged: VecDeque<String>,
    retention_limit: usize,
}

impl SchedulerState {
    fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.running.is_none()
    }

    fn evict_excess(&mut self) {
        while self.aged.len() > self.retention_limit {
            let Some(id) = self.aged.pop_front() else {
                break;
            };
            self.jobs.remove(&id);
            self.order.retain(|retained| retained != &id);
            tracing::debug!("Evicted job {} from the retained history", id);
        }
    }
}

fn job_ptr<J: ?Sized>(job: &Arc<J>) -> *const () {
    Arc::as_ptr(job) as *const ()
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    queue_tx: Sender<QueueEntry>,
    queue_rx: Receiver<QueueEntry>,
    runtime: JobRuntime,
    id_generator: Arc<dyn IdGenerator>,
    worker_thread_name: String,
    /// Registered on every submitted job
    listener: Arc<dyn JobListener>,
}

impl SchedulerInner {
    fn submit<J: Job>(&self, state: &mut SchedulerState, id: String, job: J) -> JobHandle<J::Output> {
        let scheduled = ScheduledJob::new(id.clone(), job, self.runtime.clone());
        scheduled.add_job_listener(Arc::clone(&self.listener));

        let control: Arc<dyn JobControl> = scheduled.clone();
        state.queued.push_back(Arc::clone(&control));
        state.jobs.insert(id.clone(), Arc::clone(&control));
        state.order.push_back(id.clone());

        let entry = QueueEntry {
            control,
            exec: scheduled.clone(),
        };
        if self.queue_tx.send(entry).is_err() {
            tracing::error!("Scheduler queue closed, job {} will not run", id);
        }
        tracing::debug!("Scheduled job {}", id);
        scheduled
    }

    fn unused_id(&self, state: &SchedulerState) -> String {
        loop {
            let id = self.id_generator.next_id();
            if !state.jobs.contains_key(&id) {
                return id;
            }
        }
    }

    fn job_state_changed(&self, event: &JobEvent) {
        let source = job_ptr(event.source());
        let mut state = self.state.lock();

        if event.old_state() == State::Scheduled {
            state.queued.retain(|job| job_ptr(job) != source);
            state.aged.push_back(event.job_id().to_string());
            state.evict_excess();
        }

        if event.new_state().is_terminal()
            && state.running.as_ref().is_some_and(|job| job_ptr(job) == source)
        {
            state.running = None;
        }
    }

    /// Claim a dequeued entry for execution unless its job was aborted meanwhile
    fn begin(&self, entry: &QueueEntry) -> bool {
        let target = job_ptr(&entry.control);
        let mut state = self.state.lock();
        match state.queued.iter().position(|job| job_ptr(job) == target) {
            Some(index) => {
                state.queued.remove(index);
                state.running = Some(Arc::clone(&entry.control));
                true
            }
            None => false,
        }
    }

    fn end(&self, entry: &QueueEntry) {
        let target = job_ptr(&entry.control);
        let mut state = self.state.lock();
        if state.running.as_ref().is_some_and(|job| job_ptr(job) == target) {
            state.running = None;
        }
    }

    /// Execute one dequeued entry and wait for its thread to terminate
    fn run_entry(&self, entry: &QueueEntry, shutdown: Option<&Receiver<()>>) -> Step {
        let id = entry.exec.job_id().to_string();
        if !self.begin(entry) {
            tracing::debug!("Skipping job {}, aborted while queued", id);
            return Step::Skipped;
        }

        tracing::debug!("Executing job {}", id);
        let completion = entry.exec.completion();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| entry.exec.execute())) {
            tracing::error!(
                "Starting job {} panicked on the scheduler thread: {}",
                id,
                panic_message(&*payload)
            );
        }

        let interrupted = match shutdown {
            Some(shutdown) => select! {
                recv(completion) -> _ => false,
                recv(shutdown) -> _ => true,
            },
            None => {
                let _ = completion.recv();
                false
            }
        };
        if interrupted {
            tracing::info!("Scheduler stopping while job {} is still running", id);
            return Step::Interrupted;
        }

        if let Err(e) = entry.control.join(None) {
            tracing::warn!("Failed to join job {}: {}", id, e);
        }
        self.end(entry);
        Step::Finished
    }

    /// Abort every job still waiting in the queue, returning how many entries were drained
    fn abort_queued(&self) -> usize {
        let drained: Vec<QueueEntry> = self.queue_rx.try_iter().collect();
        for entry in &drained {
            entry.exec.abort_job();
        }
        drained.len()
    }

    fn run(&self, shutdown: Receiver<()>) {
        tracing::info!("Scheduler worker {} started", self.worker_thread_name);
        loop {
            let entry = select! {
                recv(self.queue_rx) -> entry => match entry {
                    Ok(entry) => entry,
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            };
            if let Step::Interrupted = self.run_entry(&entry, Some(&shutdown)) {
                break;
            }
        }
        tracing::info!("Scheduler worker {} stopped", self.worker_thread_name);
    }
}

/// Feeds state changes of submitted jobs back into the scheduler
struct SchedulerListener {
    scheduler: Weak<SchedulerInner>,
}

impl JobListener for SchedulerListener {
    fn state_changed(&self, event: &JobEvent) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.job_state_changed(event);
        }
    }
}

struct Worker {
    /// Dropping the sender tells the worker to exit
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Executes submitted jobs one at a time in FIFO order
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    worker: Mutex<Option<Worker>>,
}

impl Scheduler {
    /// Scheduler with the default configuration. The worker starts on
    /// [`ensure_started`](Self::ensure_started).
    pub fn new() -> Self {
        Self::from_parts(SchedulerConfig::default(), Collaborators::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    fn from_parts(config: SchedulerConfig, parts: Collaborators) -> Self {
        let runtime = JobRuntime {
            execution_unit_factory: parts
                .execution_unit_factory
                .unwrap_or_else(|| Arc::new(OnceUnitFactory)),
            thread_factory: parts
                .thread_factory
                .unwrap_or_else(|| config.thread_factory()),
            log_sink_factory: parts
                .log_sink_factory
                .unwrap_or_else(|| config.log_sink.factory()),
            thread_prefix: config.job_thread_prefix.clone(),
        };
        let id_generator = parts
            .id_generator
            .unwrap_or_else(|| Arc::new(UuidGenerator));
        let (queue_tx, queue_rx) = channel::unbounded();

        let inner = Arc::new_cyclic(|scheduler: &Weak<SchedulerInner>| SchedulerInner {
            state: Mutex::new(SchedulerState {
                queued: VecDeque::new(),
                running: None,
                jobs: HashMap::new(),
                order: VecDeque::new(),
                aged: VecDeque::new(),
                retention_limit: config.retention_limit,
            }),
            queue_tx,
            queue_rx,
            runtime,
            id_generator,
            worker_thread_name: config.worker_thread_name.clone(),
            listener: Arc::new(SchedulerListener {
                scheduler: scheduler.clone(),
            }),
        });

        Self {
            inner,
            worker: Mutex::new(None),
        }
    }

    /// Queue a job under a generated id
    pub fn schedule<J: Job>(&self, job: J) -> JobHandle<J::Output> {
        let mut state = self.inner.state.lock();
        let id = self.inner.unused_id(&state);
        self.inner.submit(&mut state, id, job)
    }

    /// Queue a job under a caller-supplied id
    ///
    /// Fails with [`Error::DuplicateJobId`] while a job with this id is
    /// still queued or retained.
    pub fn schedule_with_id<J: Job>(&self, id: impl Into<String>, job: J) -> Result<JobHandle<J::Output>> {
        let id = id.into();
        let mut state = self.inner.state.lock();
        if state.jobs.contains_key(&id) {
            return Err(Error::DuplicateJobId(id));
        }
        Ok(self.inner.submit(&mut state, id, job))
    }

    /// Queue a job only if the scheduler is idle
    ///
    /// Returns `None` without submitting anything when a job is queued or
    /// running. The idle check and the submission happen atomically.
    pub fn schedule_immediately<J: Job>(&self, job: J) -> Option<JobHandle<J::Output>> {
        let mut state = self.inner.state.lock();
        if !state.is_idle() {
            return None;
        }
        let id = self.inner.unused_id(&state);
        Some(self.inner.submit(&mut state, id, job))
    }

    /// Start the worker thread unless it is already running
    pub fn ensure_started(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = channel::bounded(0);
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name(self.inner.worker_thread_name.clone())
            .spawn(move || inner.run(shutdown_rx))
            .map_err(|e| Error::ThreadStart(e.to_string()))?;

        *worker = Some(Worker {
            shutdown: shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the worker and abort every job still queued
    ///
    /// Waits for the worker thread to exit. A job that is already running
    /// is left to finish on its own thread.
    pub fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(Worker { shutdown, handle }) = worker {
            drop(shutdown);
            if handle.join().is_err() {
                tracing::error!("Scheduler worker {} panicked", self.inner.worker_thread_name);
            }
        }

        let drained = self.inner.abort_queued();
        tracing::info!("Scheduler stopped, {} queue entries drained", drained);
    }

    /// Run the next queued job to completion on the calling thread's behalf
    ///
    /// Returns the executed job, or `None` if no live job is queued. Meant
    /// for driving a scheduler whose worker is not started.
    pub fn execute_next(&self) -> Option<Arc<dyn JobControl>> {
        loop {
            let entry = self.inner.queue_rx.try_recv().ok()?;
            match self.inner.run_entry(&entry, None) {
                Step::Skipped => continue,
                Step::Finished | Step::Interrupted => return Some(entry.control),
            }
        }
    }

    /// No job is queued or running
    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().is_idle()
    }

    /// Queued and retained jobs in submission order
    pub fn jobs(&self) -> Vec<Arc<dyn JobControl>> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    pub fn job(&self, id: &str) -> Option<Arc<dyn JobControl>> {
        self.inner.state.lock().jobs.get(id).cloned()
    }

    /// Number of started or finished jobs kept queryable
    pub fn retention_limit(&self) -> usize {
        self.inner.state.lock().retention_limit
    }

    /// Change the retention limit, evicting the oldest entries beyond it
    pub fn set_retention_limit(&self, limit: usize) {
        let mut state = self.inner.state.lock();
        state.retention_limit = limit;
        state.evict_excess();
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        let mut stats = SchedulerStats {
            queued: state.queued.len(),
            retained: state.jobs.len(),
            idle: state.is_idle(),
            ..SchedulerStats::default()
        };
        for job in state.jobs.values() {
            match job.state() {
                State::Scheduled => {}
                State::Starting | State::Running => stats.running += 1,
                State::AbortingStarting | State::Aborting => stats.aborting += 1,
                State::Succeeded => stats.succeeded += 1,
                State::Failed => stats.failed += 1,
                State::Aborted => stats.aborted += 1,
            }
        }
        stats
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // The worker exits once the current job is done; it is not joined.
        if let Some(worker) = self.worker.get_mut().take() {
            drop(worker.shutdown);
        }
        let drained = self.inner.abort_queued();
        if drained > 0 {
            tracing::debug!("Scheduler dropped, {} queued jobs aborted", drained);
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_thread_name", &self.inner.worker_thread_name)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Jobs waiting for execution
    pub queued: usize,
    /// Jobs queryable through `jobs()`, queued ones included
    pub retained: usize,
    pub running: usize,
    pub aborting: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub aborted: usize,
    pub idle: bool,
}

/// Collaborators overriding the configured defaults
#[derive(Default)]
struct Collaborators {
    execution_unit_factory: Option<Arc<dyn ExecutionUnitFactory>>,
    thread_factory: Option<Arc<dyn ThreadFactory>>,
    log_sink_factory: Option<Arc<dyn LogSinkFactory>>,
    id_generator: Option<Arc<dyn IdGenerator>>,
}

/// Builder for [`Scheduler`] with pluggable collaborators
#[derive(Default)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    parts: Collaborators,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn execution_unit_factory(mut self, factory: Arc<dyn ExecutionUnitFactory>) -> Self {
        self.parts.execution_unit_factory = Some(factory);
        self
    }

    /// Overrides the native threads configured by `SchedulerConfig::job_stack_size`
    pub fn thread_factory(mut self, factory: Arc<dyn ThreadFactory>) -> Self {
        self.parts.thread_factory = Some(factory);
        self
    }

    /// Overrides the sink selected by `SchedulerConfig::log_sink`
    pub fn log_sink_factory(mut self, factory: Arc<dyn LogSinkFactory>) -> Self {
        self.parts.log_sink_factory = Some(factory);
        self
    }

    pub fn id_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.parts.id_generator = Some(generator);
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        self.config.validate()?;
        Ok(Scheduler::from_parts(self.config, self.parts))
    }
}
