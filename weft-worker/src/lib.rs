//! # Weft Worker
//!
//! Per-worker subsystem of the Weft runtime: the data manager that fetches,
//! caches, copies and invalidates parameter values with ownership-preserving
//! semantics, and the executor that drives jobs through fetch → load →
//! invoke → store.
//!
//! Transports and user-code invocation are collaborators behind the
//! [`DataProvider`] and [`Invoker`] seams.

pub mod data_manager;
pub mod executor;
pub mod register;
pub mod storage;
pub mod transfer;

// Re-export commonly used types
pub use data_manager::{DataManager, DataManagerConfig, LoadedValue};
pub use executor::{InvocationOutput, Invoker, LoadedParam, OutputValue, WorkerExecutor};
pub use register::{DataRegister, Registry};
pub use storage::StorageBackend;
pub use transfer::{
    DataProvider, FetchDataListener, FetchedValue, MultiOperationFetchListener, TransferRequest,
    WaitListener,
};

/// Result type for worker operations, shared with `weft-core`.
pub type Result<T> = weft_core::Result<T>;
