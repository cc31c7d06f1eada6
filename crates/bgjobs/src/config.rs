//! Configuration for the job scheduler

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::providers::{
    LogSinkFactory, NativeThreadFactory, StderrLogSinkFactory, ThreadFactory, TracingLogSinkFactory,
};

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Number of started or finished jobs kept queryable (default: 5)
    #[serde(default = "default_retention_limit")]
    pub retention_limit: usize,
    /// Name of the worker thread
    #[serde(default = "default_worker_thread_name")]
    pub worker_thread_name: String,
    /// Prefix for job execution thread names, followed by the job id
    #[serde(default = "default_job_thread_prefix")]
    pub job_thread_prefix: String,
    /// Stack size in bytes for job execution threads, platform default when unset
    #[serde(default)]
    pub job_stack_size: Option<usize>,
    /// Where job log lines go
    #[serde(default)]
    pub log_sink: LogSinkKind,
}

fn default_retention_limit() -> usize { 5 }
fn default_worker_thread_name() -> String { "bgjobs-scheduler".to_string() }
fn default_job_thread_prefix() -> String { "bgjobs-job".to_string() }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retention_limit: default_retention_limit(),
            worker_thread_name: default_worker_thread_name(),
            job_thread_prefix: default_job_thread_prefix(),
            job_stack_size: None,
            log_sink: LogSinkKind::default(),
        }
    }
}

impl SchedulerConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!("Loaded scheduler config from {}", path.as_ref().display());
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_thread_name.trim().is_empty() {
            return Err(Error::config("worker_thread_name must not be empty"));
        }
        if self.job_thread_prefix.trim().is_empty() {
            return Err(Error::config("job_thread_prefix must not be empty"));
        }
        if self.job_stack_size == Some(0) {
            return Err(Error::config("job_stack_size must be greater than 0"));
        }
        Ok(())
    }

    /// Native thread factory honouring `job_stack_size`
    pub fn thread_factory(&self) -> Arc<dyn ThreadFactory> {
        match self.job_stack_size {
            Some(stack_size) => Arc::new(NativeThreadFactory::with_stack_size(stack_size)),
            None => Arc::new(NativeThreadFactory::new()),
        }
    }
}

/// Built-in log sink selection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSinkKind {
    /// `SEVERITY: id: message` lines on standard error
    #[default]
    Stderr,
    /// `tracing` events with a `job_id` field
    Tracing,
}

impl LogSinkKind {
    pub fn factory(&self) -> Arc<dyn LogSinkFactory> {
        match self {
            Self::Stderr => Arc::new(StderrLogSinkFactory),
            Self::Tracing => Arc::new(TracingLogSinkFactory),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::BackgroundThread;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.retention_limit, 5);
        assert_eq!(config.log_sink, LogSinkKind::Stderr);
        assert_eq!(config.job_thread_prefix, "bgjobs-job");
        assert_eq!(config.job_stack_size, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SchedulerConfig::from_toml_str("retention_limit = 10\nlog_sink = \"tracing\"\n").unwrap();
        assert_eq!(config.retention_limit, 10);
        assert_eq!(config.log_sink, LogSinkKind::Tracing);
        assert_eq!(config.worker_thread_name, "bgjobs-scheduler");
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(SchedulerConfig::from_toml_str("").unwrap(), SchedulerConfig::default());
    }

    #[test]
    fn test_rejects_empty_thread_name() {
        let err = SchedulerConfig::from_toml_str("worker_thread_name = \"  \"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = SchedulerConfig::from_toml_str("retention_limit = \"many\"").unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "retention_limit = 2").unwrap();
        writeln!(file, "job_thread_prefix = \"worker\"").unwrap();

        let config = SchedulerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.retention_limit, 2);
        assert_eq!(config.job_thread_prefix, "worker");
    }

    #[test]
    fn test_job_stack_size() {
        let config = SchedulerConfig::from_toml_str("job_stack_size = 4194304").unwrap();
        assert_eq!(config.job_stack_size, Some(4 * 1024 * 1024));

        let thread = config.thread_factory().create_thread("big-stack", Box::new(|| {}));
        thread.start().unwrap();
        assert!(thread.join(Some(std::time::Duration::from_secs(10))));

        let err = SchedulerConfig::from_toml_str("job_stack_size = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = SchedulerConfig::from_file("/nonexistent/bgjobs.toml").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
