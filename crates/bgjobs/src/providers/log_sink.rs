//! Per-execution log destinations

use parking_lot::Mutex;
use std::io::Write;

use crate::job::Severity;

/// Receives the log lines of one job execution
#[cfg_attr(test, mockall::automock)]
pub trait LogSink: Send + Sync {
    fn log(&self, severity: Severity, message: &str);

    /// Called exactly once when the execution ends, however it ends
    fn close(&self);
}

/// Creates one [`LogSink`] per job execution
#[cfg_attr(test, mockall::automock)]
pub trait LogSinkFactory: Send + Sync {
    fn create_log_sink(&self, job_id: &str) -> Box<dyn LogSink>;
}

/// Writes `SEVERITY: id: message` lines to standard error
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrLogSinkFactory;

impl LogSinkFactory for StderrLogSinkFactory {
    fn create_log_sink(&self, job_id: &str) -> Box<dyn LogSink> {
        Box::new(WriterLogSink::new(job_id, std::io::stderr()))
    }
}

/// Writes `SEVERITY: id: message` lines to any writer
pub struct WriterLogSink<W: Write + Send> {
    job_id: String,
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterLogSink<W> {
    pub fn new(job_id: impl Into<String>, writer: W) -> Self {
        Self {
            job_id: job_id.into(),
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> LogSink for WriterLogSink<W> {
    fn log(&self, severity: Severity, message: &str) {
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{}: {}: {}", severity, self.job_id, message) {
            tracing::warn!("Failed to write log line for job {}: {}", self.job_id, e);
        }
    }

    fn close(&self) {
        if let Err(e) = self.writer.lock().flush() {
            tracing::warn!("Failed to flush log for job {}: {}", self.job_id, e);
        }
    }
}

/// Forwards job log lines to `tracing` with a `job_id` field
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSinkFactory;

impl LogSinkFactory for TracingLogSinkFactory {
    fn create_log_sink(&self, job_id: &str) -> Box<dyn LogSink> {
        Box::new(TracingLogSink {
            job_id: job_id.to_string(),
        })
    }
}

struct TracingLogSink {
    job_id: String,
}

impl LogSink for TracingLogSink {
    fn log(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => tracing::info!(job_id = %self.job_id, "{}", message),
            Severity::Warning => tracing::warn!(job_id = %self.job_id, "{}", message),
            Severity::Error => tracing::error!(job_id = %self.job_id, "{}", message),
        }
    }

    fn close(&self) {
        tracing::trace!(job_id = %self.job_id, "Job log closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_sink_format() {
        let sink = WriterLogSink::new("abc-123", Vec::new());
        sink.log(Severity::Info, "starting");
        sink.log(Severity::Error, "boom");
        sink.close();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(output, "INFO: abc-123: starting\nERROR: abc-123: boom\n");
    }

    #[test]
    fn test_tracing_sink_accepts_all_severities() {
        let sink = TracingLogSinkFactory.create_log_sink("job-1");
        sink.log(Severity::Info, "info");
        sink.log(Severity::Warning, "warning");
        sink.log(Severity::Error, "error");
        sink.close();
    }
}
