//! Task implementations and worker resources
//!
//! A task declares one or more implementation candidates; each carries a
//! resource vector and an optional worker kind. The scheduler picks the
//! highest-scoring (worker, implementation) pair with sufficient free
//! resources.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a worker, unique across the resource pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource vector: requested by implementations, offered by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescription {
    pub cores: u32,
    pub memory_mb: u64,
    pub storage_mb: u64,
    pub accelerators: u32,
}

impl ResourceDescription {
    pub fn new(cores: u32, memory_mb: u64) -> Self {
        Self {
            cores,
            memory_mb,
            storage_mb: 0,
            accelerators: 0,
        }
    }

    pub fn with_storage_mb(mut self, storage_mb: u64) -> Self {
        self.storage_mb = storage_mb;
        self
    }

    pub fn with_accelerators(mut self, accelerators: u32) -> Self {
        self.accelerators = accelerators;
        self
    }

    /// Whether `self` (available capacity) can host `requested`.
    pub fn can_host(&self, requested: &ResourceDescription) -> bool {
        self.cores >= requested.cores
            && self.memory_mb >= requested.memory_mb
            && self.storage_mb >= requested.storage_mb
            && self.accelerators >= requested.accelerators
    }

    /// Resource slack: `min_i (available_i / requested_i)` over the requested
    /// dimensions. Dimensions the implementation does not request are
    /// ignored. Higher means more headroom.
    pub fn slack(&self, requested: &ResourceDescription) -> f64 {
        let mut slack = f64::INFINITY;
        if requested.cores > 0 {
            slack = slack.min(self.cores as f64 / requested.cores as f64);
        }
        if requested.memory_mb > 0 {
            slack = slack.min(self.memory_mb as f64 / requested.memory_mb as f64);
        }
        if requested.storage_mb > 0 {
            slack = slack.min(self.storage_mb as f64 / requested.storage_mb as f64);
        }
        if requested.accelerators > 0 {
            slack = slack.min(self.accelerators as f64 / requested.accelerators as f64);
        }
        if slack.is_infinite() {
            // Nothing requested: any worker hosts it with full headroom
            1.0
        } else {
            slack
        }
    }

    /// Subtract `other` from `self`, saturating at zero.
    pub fn consume(&mut self, other: &ResourceDescription) {
        self.cores = self.cores.saturating_sub(other.cores);
        self.memory_mb = self.memory_mb.saturating_sub(other.memory_mb);
        self.storage_mb = self.storage_mb.saturating_sub(other.storage_mb);
        self.accelerators = self.accelerators.saturating_sub(other.accelerators);
    }

    /// Return previously consumed resources.
    pub fn release(&mut self, other: &ResourceDescription) {
        self.cores += other.cores;
        self.memory_mb += other.memory_mb;
        self.storage_mb += other.storage_mb;
        self.accelerators += other.accelerators;
    }
}

impl Default for ResourceDescription {
    fn default() -> Self {
        Self::new(1, 0)
    }
}

/// One implementation candidate of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation signature, the key under which execution profiles are
    /// aggregated
    pub signature: String,

    /// Resources the implementation needs to run
    pub requirements: ResourceDescription,

    /// Worker kind the implementation targets; `None` runs anywhere
    pub worker_kind: Option<String>,

    /// Per-implementation execution budget in milliseconds; `None` means
    /// unbounded
    pub timeout_ms: Option<u64>,
}

impl Implementation {
    pub fn new(signature: impl Into<String>, requirements: ResourceDescription) -> Self {
        Self {
            signature: signature.into(),
            requirements,
            worker_kind: None,
            timeout_ms: None,
        }
    }

    pub fn with_worker_kind(mut self, kind: impl Into<String>) -> Self {
        self.worker_kind = Some(kind.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Whether this implementation can run on a worker of the given kind.
    pub fn targets_kind(&self, kind: &str) -> bool {
        match &self.worker_kind {
            Some(wanted) => wanted == kind,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_host() {
        let worker = ResourceDescription::new(4, 8192);
        assert!(worker.can_host(&ResourceDescription::new(2, 4096)));
        assert!(!worker.can_host(&ResourceDescription::new(8, 1024)));
        assert!(!worker.can_host(&ResourceDescription::new(1, 1024).with_accelerators(1)));
    }

    #[test]
    fn test_slack_is_min_ratio() {
        let worker = ResourceDescription::new(8, 4096);
        let req = ResourceDescription::new(2, 2048);
        // cores 8/2 = 4, memory 4096/2048 = 2 -> min 2
        assert!((worker.slack(&req) - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_slack_with_empty_request() {
        let worker = ResourceDescription::new(8, 4096);
        let req = ResourceDescription {
            cores: 0,
            memory_mb: 0,
            storage_mb: 0,
            accelerators: 0,
        };
        assert!((worker.slack(&req) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_consume_release_roundtrip() {
        let mut avail = ResourceDescription::new(4, 8192);
        let req = ResourceDescription::new(2, 2048);
        avail.consume(&req);
        assert_eq!(avail.cores, 2);
        assert_eq!(avail.memory_mb, 6144);
        avail.release(&req);
        assert_eq!(avail, ResourceDescription::new(4, 8192));
    }

    #[test]
    fn test_worker_kind_targeting() {
        let any = Implementation::new("blur", ResourceDescription::default());
        let gpu = Implementation::new("blur_gpu", ResourceDescription::default())
            .with_worker_kind("gpu");
        assert!(any.targets_kind("cpu"));
        assert!(gpu.targets_kind("gpu"));
        assert!(!gpu.targets_kind("cpu"));
    }
}
