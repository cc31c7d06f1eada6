//! Wrapper that forwards to another job status
//!
//! Useful to present a scheduled job under a different description or
//! visibility without touching the job itself.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::event::JobListener;
use crate::status::{JobControl, JobInfo, JobStatus, State};

/// Forwards every call to the wrapped status, with optional overrides
pub struct StatusDecorator<T> {
    inner: Arc<dyn JobStatus<T>>,
    description: Option<String>,
    visible: Option<bool>,
}

impl<T> StatusDecorator<T> {
    pub fn new(inner: Arc<dyn JobStatus<T>>) -> Self {
        Self {
            inner,
            description: None,
            visible: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_visibility(mut self, visible: bool) -> Self {
        self.visible = Some(visible);
        self
    }

    /// The decorated status
    pub fn inner(&self) -> &Arc<dyn JobStatus<T>> {
        &self.inner
    }
}

impl<T: Send + Sync> JobInfo for StatusDecorator<T> {
    fn state(&self) -> State {
        self.inner.state()
    }

    fn work_done(&self) -> u32 {
        self.inner.work_done()
    }

    fn work_total(&self) -> u32 {
        self.inner.work_total()
    }

    fn id(&self) -> &str {
        self.inner.id()
    }

    fn description(&self) -> String {
        match &self.description {
            Some(description) => description.clone(),
            None => self.inner.description(),
        }
    }

    fn job_type(&self) -> &'static str {
        self.inner.job_type()
    }

    fn start_time(&self) -> DateTime<Utc> {
        self.inner.start_time()
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.inner.last_modified()
    }

    fn is_visible(&self) -> bool {
        self.visible.unwrap_or_else(|| self.inner.is_visible())
    }
}

impl<T: Send + Sync> JobControl for StatusDecorator<T> {
    fn abort(&self) {
        self.inner.abort();
    }

    fn join(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.join(timeout)
    }

    fn is_cancellation_supported(&self) -> bool {
        self.inner.is_cancellation_supported()
    }

    fn add_job_listener(&self, listener: Arc<dyn JobListener>) {
        self.inner.add_job_listener(listener);
    }

    fn remove_job_listener(&self, listener: &Arc<dyn JobListener>) {
        self.inner.remove_job_listener(listener);
    }
}

impl<T: Send + Sync> JobStatus<T> for StatusDecorator<T> {
    fn result(&self) -> Result<Arc<T>> {
        self.inner.result()
    }

    fn result_timeout(&self, timeout: Duration) -> Result<Arc<T>> {
        self.inner.result_timeout(timeout)
    }
}

impl<T> std::fmt::Debug for StatusDecorator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusDecorator")
            .field("id", &self.inner.id())
            .field("description", &self.description)
            .field("visible", &self.visible)
            .finish()
    }
}
