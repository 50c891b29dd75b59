//! # hs-runner
//!
//! Runs hyperparameter sweeps: loads and validates sweep definitions, renders
//! trial command lines, dispatches runs as child processes, collects the
//! objective metric and drives everything from a bounded worker pool.

pub mod command;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod metric;

pub use command::{BoolStyle, CommandTemplate, CommandToken, RenderedCommand};
pub use config::{ParameterConfig, RetryConfig, SweepBudget, SweepConfig, SweepDefinition};
pub use controller::{SweepController, SweepReport};
pub use dispatch::{
    CapturedOutput, LaunchRequest, OutputLine, OutputStream, ProcessDispatcher, ProcessHandle,
    RetryingDispatcher, RunCompletion, RunDispatcher, RunHandle, StopHandle, StopSignal,
};
pub use metric::{InMemoryReporter, MetricCollector, MetricReporter};
