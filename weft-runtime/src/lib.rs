//! # Weft Runtime
//!
//! Master side of the Weft dataflow runtime: a single-threaded dispatcher
//! owning the data info provider, the task analyser and the scheduler, plus
//! the worker-agent seam, retry policy, metrics and telemetry.
//!
//! User-facing entry points live on [`Weft`]; worker transports implement
//! [`WorkerAgent`] and feed completions back through the same handle.

pub mod access_processor;
pub mod agent;
pub mod data_info;
pub mod metrics;
pub mod retry;
pub mod task_analyser;
pub mod telemetry;

// Re-export commonly used types
pub use access_processor::{OpenData, Weft};
pub use agent::{
    DataSource, JobCompletion, JobParam, JobPayload, JobRequest, JobStatus, ProducedData,
    ProfilingRecord, SourceUri, WorkerAgent,
};
pub use data_info::{DataInfoProvider, RegisteredAccess, WriteOutcome};
pub use retry::{RetryPolicy, RetryStrategy};
pub use task_analyser::{EndOutcome, ProcessedTask, ResolvedParam, TaskAnalyser};
pub use telemetry::init_tracing;

/// Result type for runtime operations, shared with `weft-core`.
pub type Result<T> = weft_core::Result<T>;
