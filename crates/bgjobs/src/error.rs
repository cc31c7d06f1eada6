//! Error types for the job scheduler

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Scheduler errors
#[derive(Debug, Error)]
pub enum Error {
    /// The job ended in `ABORTED`, so it has no result
    #[error("Job {id} was cancelled")]
    Cancelled { id: String },

    /// The job's work function returned an error or panicked
    #[error("Job {id} failed: {cause:#}")]
    Failed {
        id: String,
        cause: Arc<anyhow::Error>,
    },

    /// A bounded wait expired before the job finished
    #[error("Timed out after {waited:?} waiting for job {id}")]
    Timeout { id: String, waited: Duration },

    /// A job with this id is still queued or retained
    #[error("Duplicate job id: {0}")]
    DuplicateJobId(String),

    /// The execution thread could not be started
    #[error("Failed to start thread: {0}")]
    ThreadStart(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Create a cancellation error
    pub fn cancelled(id: impl Into<String>) -> Self {
        Self::Cancelled { id: id.into() }
    }

    /// Create a job failure error
    pub fn failed(id: impl Into<String>, cause: Arc<anyhow::Error>) -> Self {
        Self::Failed {
            id: id.into(),
            cause,
        }
    }

    /// Create a timeout error
    pub fn timeout(id: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            id: id.into(),
            waited,
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error reports a cancelled job
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether this error reports a failed job
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Whether this error reports an expired wait
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The error raised by the job, if this is a job failure
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Failed { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}
