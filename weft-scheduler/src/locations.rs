//! Master-side view of where renamings physically live
//!
//! Updated on job completions (produced renamings) and data-arrival events;
//! consulted by locality scoring and by the dispatcher when listing transfer
//! sources for a job.

use std::collections::HashMap;
use weft_core::WorkerId;

#[derive(Debug, Default)]
pub struct LocationRegistry {
    locations: HashMap<String, HashMap<WorkerId, u64>>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `renaming` is present on `worker` with the given size.
    pub fn add(&mut self, renaming: &str, worker: WorkerId, size_bytes: u64) {
        self.locations
            .entry(renaming.to_string())
            .or_default()
            .insert(worker, size_bytes);
    }

    /// Size of the renaming on the worker, if present there.
    pub fn size_on(&self, renaming: &str, worker: &WorkerId) -> Option<u64> {
        self.locations.get(renaming).and_then(|m| m.get(worker)).copied()
    }

    /// Every worker currently hosting the renaming, with sizes.
    pub fn hosts(&self, renaming: &str) -> Vec<(WorkerId, u64)> {
        self.locations
            .get(renaming)
            .map(|m| m.iter().map(|(w, &s)| (w.clone(), s)).collect())
            .unwrap_or_default()
    }

    /// Forget a renaming everywhere (obsolete eviction).
    pub fn forget(&mut self, renaming: &str) {
        self.locations.remove(renaming);
    }

    /// Drop every location on a removed worker.
    pub fn remove_worker(&mut self, worker: &WorkerId) {
        self.locations.retain(|_, hosts| {
            hosts.remove(worker);
            !hosts.is_empty()
        });
    }
}
