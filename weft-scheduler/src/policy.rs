//! Pluggable scoring policies
//!
//! A policy exposes a single scoring operation plus two hooks; queueing,
//! resource accounting and tie-breaking are shared infrastructure in
//! [`crate::TaskScheduler`].

use crate::locations::LocationRegistry;
use crate::profile::ProfileRegistry;
use crate::scheduler::SchedulableAction;
use crate::worker_view::WorkerView;
use weft_core::{Implementation, Score, SchedulerPolicyKind};

/// Everything a policy may consult when scoring one (action, worker,
/// implementation) combination.
pub struct ScoreContext<'a> {
    pub action: &'a SchedulableAction,
    pub worker: &'a WorkerView,
    pub implementation: &'a Implementation,
    pub locations: &'a LocationRegistry,
    pub profiles: &'a ProfileRegistry,
    /// Priority after starvation bumping
    pub effective_priority: i64,
}

impl ScoreContext<'_> {
    /// Bytes and count of the action's inputs already present on the worker.
    pub fn input_locality(&self) -> (u64, u32) {
        let mut bytes = 0;
        let mut count = 0;
        for input in &self.action.inputs {
            if let Some(size) = self.locations.size_on(&input.renaming, self.worker.id()) {
                bytes += size;
                count += 1;
            }
        }
        (bytes, count)
    }

    /// Locality of the successors' inputs, for lookahead scoring.
    pub fn successor_locality(&self) -> (u64, u32) {
        let mut bytes = 0;
        let mut count = 0;
        for input in &self.action.successor_inputs {
            if let Some(size) = self.locations.size_on(&input.renaming, self.worker.id()) {
                bytes += size;
                count += 1;
            }
        }
        (bytes, count)
    }

    pub fn resource_slack(&self) -> f64 {
        self.worker
            .available()
            .slack(&self.implementation.requirements)
    }

    /// `-expected_wall_time`; unknown profiles score 0.
    pub fn implementation_score(&self) -> f64 {
        self.profiles
            .expected_wall_ms(&self.action.signature, self.worker.id())
            .map(|ms| -ms)
            .unwrap_or(0.0)
    }
}

/// A scheduling policy: one scoring operation plus lifecycle hooks.
pub trait SchedulingPolicy: Send {
    fn name(&self) -> &'static str;

    fn score(&self, ctx: &ScoreContext<'_>) -> Score;

    /// Called when an action enters the ready queue.
    fn on_action_ready(&mut self, _action: &SchedulableAction) {}

    /// Called when an action leaves the scheduler.
    fn on_action_end(&mut self, _action: &SchedulableAction) {}

    /// Lookahead policies commit an action to its best worker's local queue
    /// when no worker has free resources; ready policies keep it unassigned.
    fn commits_lookahead(&self) -> bool {
        false
    }
}

/// Priority only, FIFO within equals.
pub struct FifoPolicy;

impl SchedulingPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn score(&self, ctx: &ScoreContext<'_>) -> Score {
        Score::new(ctx.effective_priority)
    }
}

/// Full score tuple: priority, locality, resource slack, profile estimate.
pub struct LocalityPolicy;

impl SchedulingPolicy for LocalityPolicy {
    fn name(&self) -> &'static str {
        "locality"
    }

    fn score(&self, ctx: &ScoreContext<'_>) -> Score {
        let (locality_bytes, locality_count) = ctx.input_locality();
        Score {
            priority: ctx.effective_priority,
            locality_bytes,
            locality_count,
            resource_slack: ctx.resource_slack(),
            implementation: ctx.implementation_score(),
        }
    }
}

/// Locality-first, FIFO within equals: resource and profile components are
/// deliberately left out so equal-locality actions keep submission order.
pub struct DataPolicy;

impl SchedulingPolicy for DataPolicy {
    fn name(&self) -> &'static str {
        "data"
    }

    fn score(&self, ctx: &ScoreContext<'_>) -> Score {
        let (locality_bytes, locality_count) = ctx.input_locality();
        Score {
            priority: ctx.effective_priority,
            locality_bytes,
            locality_count,
            resource_slack: 0.0,
            implementation: 0.0,
        }
    }
}

/// Lookahead policy: the successors' input locality joins the score, and
/// actions commit to their best worker's queue even when it is busy.
pub struct FullGraphPolicy;

impl SchedulingPolicy for FullGraphPolicy {
    fn name(&self) -> &'static str {
        "full_graph"
    }

    fn score(&self, ctx: &ScoreContext<'_>) -> Score {
        let (input_bytes, input_count) = ctx.input_locality();
        let (succ_bytes, succ_count) = ctx.successor_locality();
        Score {
            priority: ctx.effective_priority,
            locality_bytes: input_bytes + succ_bytes,
            locality_count: input_count + succ_count,
            resource_slack: ctx.resource_slack(),
            implementation: ctx.implementation_score(),
        }
    }

    fn commits_lookahead(&self) -> bool {
        true
    }
}

/// Instantiate the policy selected at startup.
pub fn make_policy(kind: SchedulerPolicyKind) -> Box<dyn SchedulingPolicy> {
    match kind {
        SchedulerPolicyKind::Fifo => Box::new(FifoPolicy),
        SchedulerPolicyKind::Locality => Box::new(LocalityPolicy),
        SchedulerPolicyKind::Data => Box::new(DataPolicy),
        SchedulerPolicyKind::FullGraph => Box::new(FullGraphPolicy),
    }
}
