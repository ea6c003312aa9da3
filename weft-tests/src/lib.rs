//! Shared test harness for Weft
//!
//! Provides in-process worker agents, a loopback data plane and task
//! builders for deterministic end-to-end scenarios.

pub mod builders;
pub mod mocks;

pub use builders::TaskBuilder;
pub use mocks::{DataPlane, EventLog, FnInvoker, InProcessWorker};
