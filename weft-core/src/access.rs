//! Data access modes
//!
//! An access pairs a data id with a mode. Read-bearing modes resolve to the
//! latest instance of the data; write-bearing modes allocate a successor
//! version. Concurrent and commutative modes relax ordering: multiple
//! simultaneous accesses share one pending version.

use crate::data::DataId;
use serde::{Deserialize, Serialize};

/// How a parameter touches its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    /// Read-only
    Read,

    /// Write-only; the previous version is never observed
    Write,

    /// Read then write in-place
    ReadWrite,

    /// Concurrent: multiple simultaneous accesses to the same version
    Concurrent,

    /// Commutative: unordered updates whose final state is order-independent
    Commutative,
}

impl AccessMode {
    /// Whether the access observes the current value.
    pub fn reads(&self) -> bool {
        !matches!(self, AccessMode::Write)
    }

    /// Whether the access produces a new version.
    pub fn writes(&self) -> bool {
        !matches!(self, AccessMode::Read)
    }

    /// Concurrent and commutative accesses share a pending version instead of
    /// chaining exclusive successors.
    pub fn is_relaxed(&self) -> bool {
        matches!(self, AccessMode::Concurrent | AccessMode::Commutative)
    }
}

/// A single access of a task parameter on a data id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub data_id: DataId,
    pub mode: AccessMode,
}

impl Access {
    pub fn new(data_id: DataId, mode: AccessMode) -> Self {
        Self { data_id, mode }
    }
}
