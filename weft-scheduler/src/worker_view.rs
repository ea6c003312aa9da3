//! Per-worker scheduling state
//!
//! Tracks total and available resources, the actions placed on the worker
//! and a local queue of lookahead assignments.

use crate::scheduler::SchedulableAction;
use std::collections::{HashMap, VecDeque};
use weft_core::{ResourceDescription, TaskId, WorkerId};

#[derive(Debug)]
pub struct WorkerView {
    id: WorkerId,
    kind: String,
    total: ResourceDescription,
    available: ResourceDescription,
    placed: HashMap<TaskId, (SchedulableAction, ResourceDescription)>,
    pub(crate) local_queue: VecDeque<SchedulableAction>,
}

impl WorkerView {
    pub fn new(id: WorkerId, kind: impl Into<String>, resources: ResourceDescription) -> Self {
        Self {
            id,
            kind: kind.into(),
            total: resources,
            available: resources,
            placed: HashMap::new(),
            local_queue: VecDeque::new(),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn total(&self) -> &ResourceDescription {
        &self.total
    }

    pub fn available(&self) -> &ResourceDescription {
        &self.available
    }

    /// Number of actions currently placed on the worker.
    pub fn running_count(&self) -> usize {
        self.placed.len()
    }

    pub fn can_host(&self, requested: &ResourceDescription) -> bool {
        self.available.can_host(requested)
    }

    /// Reserve resources for an action placed here.
    pub fn reserve(&mut self, action: SchedulableAction, requested: ResourceDescription) {
        self.available.consume(&requested);
        self.placed.insert(action.task_id, (action, requested));
    }

    /// Free the resources of a finished or cancelled action.
    pub fn release(&mut self, task_id: TaskId) -> Option<SchedulableAction> {
        let (action, requested) = self.placed.remove(&task_id)?;
        self.available.release(&requested);
        Some(action)
    }

    pub fn is_placed(&self, task_id: TaskId) -> bool {
        self.placed.contains_key(&task_id)
    }

    /// Drain every placed action, e.g. when the worker is removed.
    pub fn drain_placed(&mut self) -> Vec<SchedulableAction> {
        self.available = self.total;
        self.placed.drain().map(|(_, (action, _))| action).collect()
    }
}
