//! A job made of sequential, weighted steps
//!
//! Every step gets a share of `100 × weight` progress units. The composite
//! announces the sum of all shares up front and maps each step's own
//! progress reports into its share.

use anyhow::Context;
use parking_lot::Mutex;
use std::any::Any;
use std::time::Duration;

use crate::job::{Job, Monitor, Severity};

/// Progress units granted per unit of weight
const UNITS_PER_WEIGHT: u64 = 100;

/// Results of the executed steps, in order
pub type CompositeOutput = Vec<Box<dyn Any + Send + Sync>>;

/// Object-safe view of a step
trait Step: Send + Sync {
    fn run(&self, monitor: &dyn Monitor) -> anyhow::Result<Box<dyn Any + Send + Sync>>;
    fn description(&self) -> String;
    fn is_cancellation_supported(&self) -> bool;
}

struct JobStep<J>(J);

impl<J: Job> Step for JobStep<J> {
    fn run(&self, monitor: &dyn Monitor) -> anyhow::Result<Box<dyn Any + Send + Sync>> {
        let output = self.0.work(monitor)?;
        Ok(Box::new(output))
    }

    fn description(&self) -> String {
        self.0.description()
    }

    fn is_cancellation_supported(&self) -> bool {
        self.0.is_cancellation_supported()
    }
}

struct WeightedStep {
    weight: u32,
    step: Box<dyn Step>,
}

impl WeightedStep {
    fn share(&self) -> u64 {
        UNITS_PER_WEIGHT * u64::from(self.weight)
    }
}

/// Runs its steps one after another, stopping early on cancellation
///
/// ```ignore
/// let job = CompositeJob::new("import")
///     .step(FnJob::new("download", download))
///     .weighted_step(3, FnJob::new("index", index));
/// ```
pub struct CompositeJob {
    description: String,
    steps: Vec<WeightedStep>,
    /// Index of the step currently executing
    current: Mutex<Option<usize>>,
}

impl CompositeJob {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            steps: Vec::new(),
            current: Mutex::new(None),
        }
    }

    /// Append a step with weight 1
    pub fn step<J: Job>(self, job: J) -> Self {
        self.weighted_step(1, job)
    }

    /// Append a step with the given weight. Weight 0 contributes no progress.
    pub fn weighted_step<J: Job>(mut self, weight: u32, job: J) -> Self {
        self.steps.push(WeightedStep {
            weight,
            step: Box::new(JobStep(job)),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn run_steps(&self, monitor: &dyn Monitor) -> anyhow::Result<CompositeOutput> {
        let total: u64 = self.steps.iter().map(WeightedStep::share).sum();
        monitor.announce_total(clamp(total));

        let mut outputs = CompositeOutput::with_capacity(self.steps.len());
        let mut offset = 0u64;
        for (index, weighted) in self.steps.iter().enumerate() {
            if monitor.is_aborting() {
                break;
            }
            *self.current.lock() = Some(index);

            let sub_monitor = SubJobMonitor {
                outer: monitor,
                offset,
                share: weighted.share(),
                progress: Mutex::new(SubProgress::default()),
            };
            let output = weighted.step.run(&sub_monitor).with_context(|| {
                format!("Step {} ({}) failed", index + 1, weighted.step.description())
            })?;
            outputs.push(output);
            offset += weighted.share();
        }
        Ok(outputs)
    }
}

impl Job for CompositeJob {
    type Output = CompositeOutput;

    fn work(&self, monitor: &dyn Monitor) -> anyhow::Result<CompositeOutput> {
        let result = self.run_steps(monitor);
        *self.current.lock() = None;
        result
    }

    /// The static description, followed by ` / {step}` while a step runs
    fn description(&self) -> String {
        let current = *self.current.lock();
        match current.and_then(|index| self.steps.get(index)) {
            Some(weighted) => format!("{} / {}", self.description, weighted.step.description()),
            None => self.description.clone(),
        }
    }

    fn is_cancellation_supported(&self) -> bool {
        self.steps.iter().all(|s| s.step.is_cancellation_supported())
    }
}

impl std::fmt::Debug for CompositeJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeJob")
            .field("description", &self.description)
            .field("steps", &self.steps.len())
            .finish()
    }
}

fn clamp(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[derive(Default)]
struct SubProgress {
    total: u32,
    done: u32,
}

/// Translates one step's progress into the composite's progress units
struct SubJobMonitor<'a> {
    outer: &'a dyn Monitor,
    /// Units completed by earlier steps
    offset: u64,
    /// Units this step may contribute
    share: u64,
    progress: Mutex<SubProgress>,
}

impl SubJobMonitor<'_> {
    fn report(&self, update: impl FnOnce(&mut SubProgress)) {
        let absolute = {
            let mut progress = self.progress.lock();
            update(&mut progress);
            if progress.total == 0 {
                self.offset
            } else {
                self.offset + u64::from(progress.done) * self.share / u64::from(progress.total)
            }
        };
        self.outer.report_progress_absolute(clamp(absolute));
    }
}

impl Monitor for SubJobMonitor<'_> {
    fn log(&self, severity: Severity, message: &str) {
        self.outer.log(severity, message);
    }

    fn is_aborting(&self) -> bool {
        self.outer.is_aborting()
    }

    fn scheduled_job_id(&self) -> &str {
        self.outer.scheduled_job_id()
    }

    fn announce_total(&self, total: u32) {
        self.progress.lock().total = total;
    }

    fn report_progress_increment(&self, delta: u32) {
        self.report(|p| p.done = p.done.saturating_add(delta));
    }

    fn report_progress_absolute(&self, done: u32) {
        self.report(|p| p.done = done);
    }

    fn wait_for_abort(&self, timeout: Duration) -> bool {
        self.outer.wait_for_abort(timeout)
    }
}
