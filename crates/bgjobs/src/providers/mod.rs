//! Pluggable collaborators: execution units, thread creation, job logs and
//! id generation
//!
//! The scheduler only talks to these traits, so tests and embedding
//! applications can swap in their own strategies.

pub mod id;
pub mod log_sink;
pub mod thread;
pub mod unit;

pub use id::{IdGenerator, SequentialIdGenerator, UuidGenerator};
pub use log_sink::{
    LogSink, LogSinkFactory, StderrLogSinkFactory, TracingLogSinkFactory, WriterLogSink,
};
pub use thread::{BackgroundThread, NativeThreadFactory, ThreadFactory, ThreadTask};
pub use unit::{ExecutionUnit, ExecutionUnitFactory, OnceUnit, OnceUnitFactory};
