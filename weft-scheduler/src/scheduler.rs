//! Shared scheduler infrastructure
//!
//! Holds the unassigned ready queue and per-worker views; places actions by
//! scoring every compatible (worker, implementation) pair and re-evaluates
//! on action end, worker changes and data arrival. Running actions are never
//! preempted.

use crate::locations::LocationRegistry;
use crate::policy::{make_policy, ScoreContext, SchedulingPolicy};
use crate::profile::{CompletionStats, ProfileRegistry};
use crate::worker_view::WorkerView;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use weft_core::{Implementation, ResourceDescription, Score, SchedulerPolicyKind, TaskId, WorkerId};

/// One input renaming of an action; sizes are resolved per-worker against
/// the location registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputData {
    pub renaming: String,
}

/// A ready task as the scheduler sees it.
#[derive(Debug, Clone)]
pub struct SchedulableAction {
    pub task_id: TaskId,
    pub signature: String,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub attempt: u32,
    pub excluded_workers: Vec<WorkerId>,
    pub implementations: Vec<Implementation>,
    pub inputs: Vec<InputData>,
    /// Inputs of known successors, consulted by lookahead policies
    pub successor_inputs: Vec<InputData>,
}

/// A placement decision: run `task_id` on `worker` with `implementation`.
#[derive(Debug, Clone)]
pub struct Placement {
    pub task_id: TaskId,
    pub worker: WorkerId,
    pub implementation: Implementation,
}

/// Where a cancelled action was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelDisposition {
    /// Removed synchronously from the ready or local queues
    Dequeued,
    /// Placed on a worker; the caller must cancel it there
    PlacedOn(WorkerId),
    /// Not tracked by the scheduler
    Unknown,
}

/// Starvation-bumping knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub starvation_wait: Duration,
    pub starvation_bump: Duration,
    /// Effective priority never exceeds `priority + max_priority_bump`
    pub max_priority_bump: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            starvation_wait: Duration::from_secs(60),
            starvation_bump: Duration::from_secs(30),
            max_priority_bump: 10,
        }
    }
}

pub struct TaskScheduler {
    policy: Box<dyn SchedulingPolicy>,
    workers: BTreeMap<WorkerId, WorkerView>,
    unassigned: Vec<SchedulableAction>,
    locations: LocationRegistry,
    profiles: ProfileRegistry,
    config: SchedulerConfig,
}

impl TaskScheduler {
    pub fn new(kind: SchedulerPolicyKind, config: SchedulerConfig) -> Self {
        let policy = make_policy(kind);
        info!(policy = policy.name(), "Scheduler initialized");
        Self {
            policy,
            workers: BTreeMap::new(),
            unassigned: Vec::new(),
            locations: LocationRegistry::new(),
            profiles: ProfileRegistry::new(),
            config,
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn locations(&self) -> &LocationRegistry {
        &self.locations
    }

    pub fn locations_mut(&mut self) -> &mut LocationRegistry {
        &mut self.locations
    }

    pub fn ready_count(&self) -> usize {
        self.unassigned.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Priority after starvation bumping, capped at `priority + 10`.
    fn effective_priority(&self, action: &SchedulableAction, now: DateTime<Utc>) -> i64 {
        let waited = (now - action.submitted_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if waited <= self.config.starvation_wait {
            return action.priority as i64;
        }
        let over = waited - self.config.starvation_wait;
        let bumps = (over.as_millis() / self.config.starvation_bump.as_millis().max(1)) as i64 + 1;
        action.priority as i64 + bumps.min(self.config.max_priority_bump)
    }

    /// Submit a ready action; places it immediately when a worker has free
    /// resources.
    pub fn submit_action(&mut self, action: SchedulableAction) -> Vec<Placement> {
        debug!(task = %action.task_id, signature = %action.signature, "Action submitted");
        self.policy.on_action_ready(&action);
        self.unassigned.push(action);
        self.place_pending()
    }

    /// Register a worker and re-evaluate pending actions.
    pub fn worker_added(
        &mut self,
        id: WorkerId,
        kind: impl Into<String>,
        resources: ResourceDescription,
    ) -> Result<Vec<Placement>> {
        if self.workers.contains_key(&id) {
            return Err(Error::DuplicateWorker(id.to_string()));
        }
        info!(worker = %id, "Worker added");
        self.workers
            .insert(id.clone(), WorkerView::new(id, kind, resources));
        Ok(self.place_pending())
    }

    /// Remove a worker. Queued actions re-enter the ready queue; actions
    /// already placed there are returned for the retry-or-fail decision.
    pub fn worker_removed(
        &mut self,
        id: &WorkerId,
    ) -> Result<(Vec<SchedulableAction>, Vec<Placement>)> {
        let mut view = self
            .workers
            .remove(id)
            .ok_or_else(|| Error::UnknownWorker(id.to_string()))?;
        warn!(worker = %id, "Worker removed");
        let lost = view.drain_placed();
        while let Some(action) = view.local_queue.pop_front() {
            self.unassigned.push(action);
        }
        self.locations.remove_worker(id);
        let placements = self.place_pending();
        Ok((lost, placements))
    }

    /// Free the worker's resources for a finished action, record its
    /// profile sample, and pull follow-up work.
    pub fn action_completed(
        &mut self,
        task_id: TaskId,
        worker: &WorkerId,
        stats: CompletionStats,
    ) -> Result<Vec<Placement>> {
        let view = self
            .workers
            .get_mut(worker)
            .ok_or_else(|| Error::UnknownWorker(worker.to_string()))?;
        let action = view
            .release(task_id)
            .ok_or_else(|| Error::UnknownAction(task_id.to_string()))?;
        self.profiles.observe(&action.signature, worker, stats);
        self.policy.on_action_end(&action);
        debug!(task = %task_id, worker = %worker, "Action completed");

        // Local queue first, then the global ready queue
        let mut placements = self.pull_local(worker);
        placements.extend(self.place_pending());
        Ok(placements)
    }

    /// Free resources without recording a profile sample (cancellation ack,
    /// degraded worker).
    pub fn action_removed(&mut self, task_id: TaskId, worker: &WorkerId) -> Vec<Placement> {
        if let Some(view) = self.workers.get_mut(worker) {
            if view.release(task_id).is_some() {
                let mut placements = self.pull_local(worker);
                placements.extend(self.place_pending());
                return placements;
            }
        }
        Vec::new()
    }

    /// Re-evaluate the ready queue, e.g. after a data-arrival event. Running
    /// actions are never preempted.
    pub fn rescore(&mut self) -> Vec<Placement> {
        self.place_pending()
    }

    /// Cancel an action wherever it currently is.
    pub fn cancel(&mut self, task_id: TaskId) -> CancelDisposition {
        if let Some(pos) = self.unassigned.iter().position(|a| a.task_id == task_id) {
            self.unassigned.remove(pos);
            return CancelDisposition::Dequeued;
        }
        for view in self.workers.values_mut() {
            if let Some(pos) = view.local_queue.iter().position(|a| a.task_id == task_id) {
                view.local_queue.remove(pos);
                return CancelDisposition::Dequeued;
            }
        }
        for (id, view) in &self.workers {
            if view.is_placed(task_id) {
                return CancelDisposition::PlacedOn(id.clone());
            }
        }
        CancelDisposition::Unknown
    }

    /// Move local-queue actions of a worker onto it while resources allow.
    fn pull_local(&mut self, worker: &WorkerId) -> Vec<Placement> {
        let mut placements = Vec::new();
        loop {
            let Some(view) = self.workers.get(worker) else {
                break;
            };
            let Some(front) = view.local_queue.front() else {
                break;
            };
            let Some(implementation) = self.viable_implementation(front, view) else {
                break;
            };
            let view = self.workers.get_mut(worker).expect("checked above");
            let action = view.local_queue.pop_front().expect("checked above");
            let requirements = implementation.requirements;
            placements.push(Placement {
                task_id: action.task_id,
                worker: worker.clone(),
                implementation,
            });
            view.reserve(action, requirements);
        }
        placements
    }

    /// First implementation of the action the worker can currently host.
    fn viable_implementation(
        &self,
        action: &SchedulableAction,
        view: &WorkerView,
    ) -> Option<Implementation> {
        if action.excluded_workers.contains(view.id()) {
            return None;
        }
        action
            .implementations
            .iter()
            .find(|i| i.targets_kind(view.kind()) && view.can_host(&i.requirements))
            .cloned()
    }

    /// Place as many unassigned actions as resources allow, highest
    /// effective priority first, FIFO within equals.
    fn place_pending(&mut self) -> Vec<Placement> {
        let now = Utc::now();
        let mut queue = std::mem::take(&mut self.unassigned);
        queue.sort_by_key(|a| std::cmp::Reverse(self.effective_priority(a, now)));

        let mut placements = Vec::new();
        let mut remaining = Vec::new();
        for action in queue {
            match self.best_assignment(&action, now) {
                Some((worker_id, implementation)) => {
                    let requirements = implementation.requirements;
                    debug!(
                        task = %action.task_id,
                        worker = %worker_id,
                        implementation = %implementation.signature,
                        "Action placed"
                    );
                    placements.push(Placement {
                        task_id: action.task_id,
                        worker: worker_id.clone(),
                        implementation,
                    });
                    self.workers
                        .get_mut(&worker_id)
                        .expect("assignment targets a registered worker")
                        .reserve(action, requirements);
                }
                None if self.policy.commits_lookahead() => {
                    if let Some(worker_id) = self.best_worker_ignoring_capacity(&action, now) {
                        debug!(task = %action.task_id, worker = %worker_id, "Action queued (lookahead)");
                        self.workers
                            .get_mut(&worker_id)
                            .expect("lookahead targets a registered worker")
                            .local_queue
                            .push_back(action);
                    } else {
                        remaining.push(action);
                    }
                }
                None => remaining.push(action),
            }
        }
        self.unassigned = remaining;
        placements
    }

    /// Best (worker, implementation) with sufficient free resources. Ties
    /// break on the smaller running queue, then the lexicographically
    /// smallest worker id (map iteration order).
    fn best_assignment(
        &self,
        action: &SchedulableAction,
        now: DateTime<Utc>,
    ) -> Option<(WorkerId, Implementation)> {
        let effective_priority = self.effective_priority(action, now);
        let mut best: Option<(Score, usize, WorkerId, Implementation)> = None;
        for (id, view) in &self.workers {
            if action.excluded_workers.contains(id) {
                continue;
            }
            for implementation in &action.implementations {
                if !implementation.targets_kind(view.kind()) {
                    continue;
                }
                if !view.can_host(&implementation.requirements) {
                    continue;
                }
                let score = self.policy.score(&ScoreContext {
                    action,
                    worker: view,
                    implementation,
                    locations: &self.locations,
                    profiles: &self.profiles,
                    effective_priority,
                });
                let better = match &best {
                    None => true,
                    Some((best_score, best_running, _, _)) => {
                        score > *best_score
                            || (score == *best_score && view.running_count() < *best_running)
                    }
                };
                if better {
                    best = Some((score, view.running_count(), id.clone(), implementation.clone()));
                }
            }
        }
        best.map(|(_, _, id, implementation)| (id, implementation))
    }

    /// Best worker for lookahead queueing, ignoring free capacity but
    /// respecting kind, exclusion and total resources.
    fn best_worker_ignoring_capacity(
        &self,
        action: &SchedulableAction,
        now: DateTime<Utc>,
    ) -> Option<WorkerId> {
        let effective_priority = self.effective_priority(action, now);
        let mut best: Option<(Score, usize, WorkerId)> = None;
        for (id, view) in &self.workers {
            if action.excluded_workers.contains(id) {
                continue;
            }
            for implementation in &action.implementations {
                if !implementation.targets_kind(view.kind()) {
                    continue;
                }
                if !view.total().can_host(&implementation.requirements) {
                    continue;
                }
                let score = self.policy.score(&ScoreContext {
                    action,
                    worker: view,
                    implementation,
                    locations: &self.locations,
                    profiles: &self.profiles,
                    effective_priority,
                });
                let better = match &best {
                    None => true,
                    Some((best_score, best_running, _)) => {
                        score > *best_score
                            || (score == *best_score && view.running_count() < *best_running)
                    }
                };
                if better {
                    best = Some((score, view.running_count(), id.clone()));
                }
            }
        }
        best.map(|(_, _, id)| id)
    }
}
