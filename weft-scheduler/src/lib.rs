//! # Weft Scheduler
//!
//! Keeps, for every ready action, a score against every compatible worker;
//! places actions respecting resource constraints and re-evaluates on
//! events: action end, worker added or removed, data arrival.
//!
//! Policies share the queueing and resource-accounting infrastructure and
//! differ only in scoring (plus two hooks); the policy is selected at
//! startup.

pub mod locations;
pub mod policy;
pub mod profile;
pub mod scheduler;
pub mod worker_view;

pub use locations::LocationRegistry;
pub use policy::{
    make_policy, DataPolicy, FifoPolicy, FullGraphPolicy, LocalityPolicy, ScoreContext,
    SchedulingPolicy,
};
pub use profile::{CompletionStats, ProfileRegistry};
pub use scheduler::{
    CancelDisposition, InputData, Placement, SchedulableAction, SchedulerConfig, TaskScheduler,
};
pub use worker_view::WorkerView;

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for scheduler operations
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),
}
