//! Data identifiers, versions and instance renamings
//!
//! A [`DataId`] names a piece of user data (a file, an object, a storage
//! reference). Every write produces a new [`DataVersion`]; a version is bound
//! to exactly one [`DataInstanceId`], whose renaming is the opaque name used
//! on the wire and in on-disk layouts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical identifier for a piece of user data.
///
/// Ids are process-unique and allocated monotonically by the data info
/// provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataId(pub u32);

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// Concrete binding of a data version to a renaming.
///
/// The renaming is assigned once and never changes; there is exactly one
/// instance per version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataInstanceId {
    pub data_id: DataId,
    pub version: u32,
}

impl DataInstanceId {
    pub fn new(data_id: DataId, version: u32) -> Self {
        Self { data_id, version }
    }

    /// The opaque renaming, stable within a process for logs and wire
    /// protocols.
    pub fn renaming(&self) -> String {
        format!("d{}_v{}", self.data_id.0, self.version)
    }
}

impl fmt::Display for DataInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}_v{}", self.data_id.0, self.version)
    }
}

/// One version in a data id's strictly increasing version chain.
#[derive(Debug, Clone)]
pub struct DataVersion {
    instance: DataInstanceId,
    readers: u32,
    invalidated: bool,
    produced: bool,
}

impl DataVersion {
    pub fn new(data_id: DataId, version: u32) -> Self {
        Self {
            instance: DataInstanceId::new(data_id, version),
            readers: 0,
            invalidated: false,
            produced: false,
        }
    }

    pub fn instance(&self) -> DataInstanceId {
        self.instance
    }

    pub fn readers(&self) -> u32 {
        self.readers
    }

    pub fn add_reader(&mut self) {
        self.readers += 1;
    }

    /// Releases one reader. Returns `true` when this call drained the last
    /// reader; callers decide whether the drained version is obsolete.
    ///
    /// Releasing with no registered readers is a double-finish: idempotent,
    /// logged, never fatal.
    pub fn release_reader(&mut self) -> bool {
        if self.readers == 0 {
            tracing::warn!(instance = %self.instance, "Double finish on data version");
            return false;
        }
        self.readers -= 1;
        self.readers == 0
    }

    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Marks the version's value as produced and published.
    pub fn mark_produced(&mut self) {
        self.produced = true;
    }

    pub fn is_produced(&self) -> bool {
        self.produced
    }

    /// A version is live while it has readers, or while it is the latest and
    /// has not been invalidated.
    pub fn is_live(&self, is_latest: bool) -> bool {
        self.readers > 0 || (is_latest && !self.invalidated)
    }
}
