//! Task analyser: builds the dependency DAG from parameter accesses
//!
//! Consumes task submissions, resolves every parameter against the data info
//! provider and records the edges that order execution: read-after-write on
//! pending producers, write-after-read on still-active readers of the
//! superseded version, and write-after-write on unconsumed writes.
//! Commutative and concurrent members form unordered bags; a follower
//! observes every bag member as a predecessor.
//!
//! The analyser is owned by the dispatcher thread; no locking.

use crate::data_info::DataInfoProvider;
use std::collections::{HashMap, HashSet};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;
use weft_core::{
    DataId, DataInstanceId, Error, Result, Task, TaskDescription, TaskId, TaskState, WorkerId,
};

/// Resolved instances of one flattened parameter, in flatten order.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedParam {
    pub read: Option<DataInstanceId>,
    pub write: Option<DataInstanceId>,
    /// First access ever on the data: the submitter's payload backs it
    pub first_access: bool,
}

/// Outcome of processing a submission.
#[derive(Debug)]
pub struct ProcessedTask {
    pub task_id: TaskId,
    /// True when the task entered the ready queue directly
    pub ready: bool,
}

/// Outcome of ending a task.
#[derive(Debug, Default)]
pub struct EndOutcome {
    /// Successors whose last predecessor just finished
    pub newly_ready: Vec<TaskId>,
    /// Successors cancelled transitively by a failed producer
    pub cancelled: Vec<TaskId>,
}

struct TaskNode {
    task: Task,
    pending: usize,
    successors: Vec<TaskId>,
    reads: Vec<DataInstanceId>,
    writes: Vec<DataInstanceId>,
    resolved: Vec<ResolvedParam>,
}

type Waiter<T> = oneshot::Sender<Result<T>>;

/// Builds and maintains the task dependency DAG.
pub struct TaskAnalyser {
    next_task_id: u64,
    tasks: HashMap<TaskId, TaskNode>,

    /// Pending exclusive producer of each write instance
    producers: HashMap<DataInstanceId, TaskId>,
    /// Pending relaxed-bag members per shared version
    bags: HashMap<(DataId, u32), HashSet<TaskId>>,
    /// Tasks registered as readers of an instance, not yet finished
    active_readers: HashMap<DataInstanceId, HashSet<TaskId>>,
    /// Count of unconfirmed write accesses per data id
    pending_writers: HashMap<DataId, usize>,

    /// Non-terminal tasks per application
    app_pending: HashMap<Uuid, HashSet<TaskId>>,
    /// Non-terminal tasks per (application, group)
    group_pending: HashMap<(Uuid, String), HashSet<TaskId>>,

    barrier_waiters: HashMap<Uuid, Vec<Waiter<()>>>,
    group_barrier_waiters: HashMap<(Uuid, String), Vec<Waiter<()>>>,
    /// Fired when a write on the data id commits (or fails for good)
    task_waiters: HashMap<DataId, Vec<Waiter<DataInstanceId>>>,
    /// Fired when the last relaxed-group member on the data id drains
    concurrent_waiters: HashMap<DataId, Vec<Waiter<()>>>,

    poisoned: bool,
}

impl TaskAnalyser {
    pub fn new() -> Self {
        Self {
            next_task_id: 0,
            tasks: HashMap::new(),
            producers: HashMap::new(),
            bags: HashMap::new(),
            active_readers: HashMap::new(),
            pending_writers: HashMap::new(),
            app_pending: HashMap::new(),
            group_pending: HashMap::new(),
            barrier_waiters: HashMap::new(),
            group_barrier_waiters: HashMap::new(),
            task_waiters: HashMap::new(),
            concurrent_waiters: HashMap::new(),
            poisoned: false,
        }
    }

    /// Whether a DAG invariant violation has stopped the analyser.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Register a submission: resolve parameters, record dependency edges,
    /// and report whether the task is immediately ready.
    pub fn process_task(
        &mut self,
        description: TaskDescription,
        dip: &mut DataInfoProvider,
    ) -> Result<ProcessedTask> {
        if self.poisoned {
            return Err(Error::CorruptSchedulerState(
                "runtime is shutting down".into(),
            ));
        }
        description.validate()?;

        self.next_task_id += 1;
        let task_id = TaskId(self.next_task_id);
        let mut task = Task::new(task_id, description);

        let mut predecessors: HashSet<TaskId> = HashSet::new();
        let mut reads = Vec::new();
        let mut writes = Vec::new();
        let mut resolved = Vec::new();

        let params: Vec<_> = task
            .description
            .params
            .iter()
            .flat_map(|p| p.flatten())
            .cloned()
            .collect();

        for param in &params {
            let Some(key) = param.value.data_key() else {
                resolved.push(ResolvedParam {
                    read: None,
                    write: None,
                    first_access: false,
                });
                continue;
            };
            let mode = param.direction.access_mode();
            let access = dip.register_access(&key, mode)?;

            if let Some(read) = access.read {
                if let Some(&producer) = self.producers.get(&read) {
                    if producer != task_id {
                        predecessors.insert(producer);
                    }
                }
                if let Some(bag) = self.bags.get(&(read.data_id, read.version)) {
                    for &member in bag {
                        if member != task_id {
                            predecessors.insert(member);
                        }
                    }
                }
                self.active_readers
                    .entry(read)
                    .or_default()
                    .insert(task_id);
                reads.push(read);
            }

            if let Some(write) = access.write {
                *self.pending_writers.entry(write.data_id).or_default() += 1;
                if access.joined_group {
                    let bag = self
                        .bags
                        .entry((write.data_id, write.version))
                        .or_default();
                    let opener = bag.is_empty();
                    bag.insert(task_id);
                    if opener {
                        // Order the bag after exclusive activity on its base
                        if let Some(read) = access.read {
                            self.add_superseded_edges(task_id, read, &mut predecessors);
                        }
                    }
                } else {
                    self.producers.insert(write, task_id);
                    let superseded = DataInstanceId::new(write.data_id, write.version - 1);
                    self.add_superseded_edges(task_id, superseded, &mut predecessors);
                }
                writes.push(write);
            }

            resolved.push(ResolvedParam {
                read: access.read,
                write: access.write,
                first_access: access.first_access,
            });
        }

        let pending = predecessors.len();
        for &pred in &predecessors {
            if let Some(node) = self.tasks.get_mut(&pred) {
                node.successors.push(task_id);
            }
        }

        let ready = pending == 0;
        task.transition(if ready {
            TaskState::Ready
        } else {
            TaskState::Waiting
        })?;

        let app_id = task.description.app_id;
        self.app_pending.entry(app_id).or_default().insert(task_id);
        if let Some(group) = task.description.group.clone() {
            self.group_pending
                .entry((app_id, group))
                .or_default()
                .insert(task_id);
        }

        debug!(
            task = %task_id,
            signature = %task.description.signature,
            pending,
            ready,
            "Task processed"
        );

        self.tasks.insert(
            task_id,
            TaskNode {
                task,
                pending,
                successors: Vec::new(),
                reads,
                writes,
                resolved,
            },
        );
        Ok(ProcessedTask { task_id, ready })
    }

    /// WAW edge to the pending producer of `superseded` and WAR edges to its
    /// still-active readers.
    fn add_superseded_edges(
        &self,
        task_id: TaskId,
        superseded: DataInstanceId,
        predecessors: &mut HashSet<TaskId>,
    ) {
        if let Some(&producer) = self.producers.get(&superseded) {
            if producer != task_id {
                predecessors.insert(producer);
            }
        }
        if let Some(bag) = self.bags.get(&(superseded.data_id, superseded.version)) {
            for &member in bag {
                if member != task_id {
                    predecessors.insert(member);
                }
            }
        }
        if let Some(readers) = self.active_readers.get(&superseded) {
            for &reader in readers {
                if reader != task_id {
                    predecessors.insert(reader);
                }
            }
        }
    }

    /// Finish a task: release reads, confirm or invalidate writes, and
    /// release or cancel successors.
    pub fn end_task(
        &mut self,
        task_id: TaskId,
        success: bool,
        dip: &mut DataInfoProvider,
    ) -> Result<EndOutcome> {
        let node = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::Internal(format!("end of unknown task {task_id}")))?;
        // A completion implies the worker ran the task, even when it raced
        // ahead of the start acknowledgement
        if node.task.state() == TaskState::Scheduled {
            node.task.transition(TaskState::Running)?;
        }
        node.task
            .transition(if success { TaskState::Done } else { TaskState::Failed })?;

        let mut outcome = EndOutcome::default();
        let mut cancel_queue = self.settle_task(task_id, success, dip, &mut outcome)?;
        while let Some(victim) = cancel_queue.pop() {
            let Some(node) = self.tasks.get_mut(&victim) else {
                continue;
            };
            if node.task.state().is_terminal() {
                continue;
            }
            node.task.transition(TaskState::Cancelled)?;
            outcome.cancelled.push(victim);
            let mut nested = self.settle_task(victim, false, dip, &mut outcome)?;
            cancel_queue.append(&mut nested);
        }
        Ok(outcome)
    }

    /// Release the data registrations of a finished or cancelled task and
    /// resolve its successors. Returns successors that must be cancelled.
    fn settle_task(
        &mut self,
        task_id: TaskId,
        success: bool,
        dip: &mut DataInfoProvider,
        outcome: &mut EndOutcome,
    ) -> Result<Vec<TaskId>> {
        let (reads, writes, successors, app_id, group) = {
            let node = self.tasks.get_mut(&task_id).expect("settled task exists");
            (
                std::mem::take(&mut node.reads),
                std::mem::take(&mut node.writes),
                std::mem::take(&mut node.successors),
                node.task.description.app_id,
                node.task.description.group.clone(),
            )
        };

        for read in &reads {
            if let Some(readers) = self.active_readers.get_mut(read) {
                readers.remove(&task_id);
                if readers.is_empty() {
                    self.active_readers.remove(read);
                }
            }
            dip.finish_access(*read)?;
        }

        let mut my_writes: HashSet<DataInstanceId> = HashSet::new();
        for write in &writes {
            my_writes.insert(*write);
            if let Some(bag) = self.bags.get_mut(&(write.data_id, write.version)) {
                bag.remove(&task_id);
                if bag.is_empty() {
                    self.bags.remove(&(write.data_id, write.version));
                }
            }
            if self.producers.get(write) == Some(&task_id) {
                self.producers.remove(write);
            }

            let write_outcome = dip.confirm_write(*write, success)?;
            if let Some(count) = self.pending_writers.get_mut(&write.data_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.pending_writers.remove(&write.data_id);
                }
            }

            if write_outcome.committed {
                if let Some(waiters) = self.task_waiters.remove(&write.data_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(*write));
                    }
                }
            } else if !success && !self.has_pending_writer(write.data_id) {
                if let Some(waiters) = self.task_waiters.remove(&write.data_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Err(Error::TaskFailure(format!(
                            "producer of {} failed",
                            write.renaming()
                        ))));
                    }
                }
            }

            if write_outcome.group_drained && !dip.has_open_relaxed_group(write.data_id) {
                if let Some(waiters) = self.concurrent_waiters.remove(&write.data_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
        }

        // Resolve successors: one edge per (pred, succ) pair
        let mut to_cancel = Vec::new();
        let mut underflow = None;
        for successor in successors {
            let Some(succ) = self.tasks.get_mut(&successor) else {
                continue;
            };
            if succ.task.state().is_terminal() {
                continue;
            }
            if !success && succ.reads.iter().any(|r| my_writes.contains(r)) {
                to_cancel.push(successor);
                continue;
            }
            if succ.pending == 0 {
                underflow = Some(successor);
                break;
            }
            succ.pending -= 1;
            if succ.pending == 0 && succ.task.state() == TaskState::Waiting {
                succ.task.transition(TaskState::Ready)?;
                outcome.newly_ready.push(successor);
            }
        }
        if let Some(successor) = underflow {
            self.poison();
            return Err(Error::CorruptSchedulerState(format!(
                "ready-count underflow on {successor}"
            )));
        }

        self.on_terminal(task_id, app_id, group);
        Ok(to_cancel)
    }

    /// Re-queue a failed attempt: Failed -> Ready with a bumped attempt
    /// counter, excluding the worker on host-sticky faults.
    pub fn retry_task(&mut self, task_id: TaskId, exclude: Option<WorkerId>) -> Result<()> {
        let node = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::Internal(format!("retry of unknown task {task_id}")))?;
        if node.task.state() == TaskState::Scheduled {
            node.task.transition(TaskState::Running)?;
        }
        node.task.transition(TaskState::Failed)?;
        node.task.transition(TaskState::Ready)?;
        node.task.attempt += 1;
        if let Some(worker) = exclude {
            node.task.exclude_worker(worker);
        }
        warn!(task = %task_id, attempt = node.task.attempt, "Task re-queued for retry");
        Ok(())
    }

    /// Cancel a single non-terminal task, cascading to successors that read
    /// its outputs. Running tasks must be cancelled through their worker
    /// first; this finalizes the analyser state.
    pub fn cancel_task(
        &mut self,
        task_id: TaskId,
        dip: &mut DataInfoProvider,
    ) -> Result<EndOutcome> {
        let node = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::Internal(format!("cancel of unknown task {task_id}")))?;
        if node.task.state().is_terminal() {
            return Ok(EndOutcome::default());
        }
        node.task.transition(TaskState::Cancelled)?;

        let mut outcome = EndOutcome::default();
        outcome.cancelled.push(task_id);
        let mut cancel_queue = self.settle_task(task_id, false, dip, &mut outcome)?;
        while let Some(victim) = cancel_queue.pop() {
            let Some(node) = self.tasks.get_mut(&victim) else {
                continue;
            };
            if node.task.state().is_terminal() {
                continue;
            }
            node.task.transition(TaskState::Cancelled)?;
            outcome.cancelled.push(victim);
            let mut nested = self.settle_task(victim, false, dip, &mut outcome)?;
            cancel_queue.append(&mut nested);
        }
        Ok(outcome)
    }

    /// Cancel every pending task of an application. Returns the analysis
    /// outcome plus the tasks that must additionally be cancelled on their
    /// workers.
    pub fn cancel_application(
        &mut self,
        app_id: Uuid,
        dip: &mut DataInfoProvider,
    ) -> Result<(EndOutcome, Vec<TaskId>)> {
        let pending: Vec<TaskId> = self
            .app_pending
            .get(&app_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        let mut outcome = EndOutcome::default();
        let mut on_worker = Vec::new();
        for task_id in pending {
            let Some(node) = self.tasks.get(&task_id) else {
                continue;
            };
            match node.task.state() {
                TaskState::Scheduled | TaskState::Running => on_worker.push(task_id),
                state if state.is_terminal() => {}
                _ => {
                    let sub = self.cancel_task(task_id, dip)?;
                    outcome.newly_ready.extend(sub.newly_ready);
                    outcome.cancelled.extend(sub.cancelled);
                }
            }
        }
        // Worker-side tasks are marked cancelled now; their data registrations
        // settle when the worker acknowledges (or times out).
        for &task_id in &on_worker {
            let sub = self.cancel_task(task_id, dip)?;
            outcome.newly_ready.extend(sub.newly_ready);
            outcome.cancelled.extend(sub.cancelled);
        }
        Ok((outcome, on_worker))
    }

    fn on_terminal(&mut self, task_id: TaskId, app_id: Uuid, group: Option<String>) {
        if let Some(set) = self.app_pending.get_mut(&app_id) {
            set.remove(&task_id);
            if set.is_empty() {
                self.app_pending.remove(&app_id);
                if let Some(waiters) = self.barrier_waiters.remove(&app_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
        }
        if let Some(group) = group {
            let key = (app_id, group);
            if let Some(set) = self.group_pending.get_mut(&key) {
                set.remove(&task_id);
                if set.is_empty() {
                    self.group_pending.remove(&key);
                    if let Some(waiters) = self.group_barrier_waiters.remove(&key) {
                        for waiter in waiters {
                            let _ = waiter.send(Ok(()));
                        }
                    }
                }
            }
        }
    }

    /// Register a barrier: the sender fires when every task the application
    /// registered before this call is terminal. Fires immediately when the
    /// application is already drained.
    pub fn barrier(&mut self, app_id: Uuid, waiter: Waiter<()>) {
        let drained = self
            .app_pending
            .get(&app_id)
            .map(|s| s.is_empty())
            .unwrap_or(true);
        if drained {
            let _ = waiter.send(Ok(()));
        } else {
            self.barrier_waiters.entry(app_id).or_default().push(waiter);
        }
    }

    /// Barrier scoped to a user-defined task group.
    pub fn barrier_group(&mut self, app_id: Uuid, group: String, waiter: Waiter<()>) {
        let key = (app_id, group);
        let drained = self
            .group_pending
            .get(&key)
            .map(|s| s.is_empty())
            .unwrap_or(true);
        if drained {
            let _ = waiter.send(Ok(()));
        } else {
            self.group_barrier_waiters
                .entry(key)
                .or_default()
                .push(waiter);
        }
    }

    /// Notify the waiter when the pending write on the data commits.
    pub fn find_waited_task(
        &mut self,
        data_id: DataId,
        dip: &DataInfoProvider,
        waiter: Waiter<DataInstanceId>,
    ) {
        if !self.has_pending_writer(data_id) {
            let result = dip
                .latest_instance(data_id)
                .ok_or_else(|| Error::UnknownData(data_id.to_string()));
            let _ = waiter.send(result);
        } else {
            self.task_waiters.entry(data_id).or_default().push(waiter);
        }
    }

    /// Notify the waiter when all concurrent/commutative accesses on the
    /// data have finished.
    pub fn find_waited_concurrent(
        &mut self,
        data_id: DataId,
        dip: &DataInfoProvider,
        waiter: Waiter<()>,
    ) {
        if !dip.has_open_relaxed_group(data_id) {
            let _ = waiter.send(Ok(()));
        } else {
            self.concurrent_waiters
                .entry(data_id)
                .or_default()
                .push(waiter);
        }
    }

    pub fn has_pending_writer(&self, data_id: DataId) -> bool {
        self.pending_writers
            .get(&data_id)
            .map(|&c| c > 0)
            .unwrap_or(false)
    }

    /// Mark the dispatcher state corrupt: release every waiter with an error
    /// and refuse further submissions.
    pub fn poison(&mut self) {
        if self.poisoned {
            return;
        }
        self.poisoned = true;
        error!("Corrupt scheduler state: draining waiters and shutting down");
        let err = || Error::CorruptSchedulerState("runtime shut down".into());
        for (_, waiters) in self.barrier_waiters.drain() {
            for w in waiters {
                let _ = w.send(Err(err()));
            }
        }
        for (_, waiters) in self.group_barrier_waiters.drain() {
            for w in waiters {
                let _ = w.send(Err(err()));
            }
        }
        for (_, waiters) in self.task_waiters.drain() {
            for w in waiters {
                let _ = w.send(Err(err()));
            }
        }
        for (_, waiters) in self.concurrent_waiters.drain() {
            for w in waiters {
                let _ = w.send(Err(err()));
            }
        }
    }

    // Accessors used by the dispatcher when building jobs

    pub fn task_state(&self, task_id: TaskId) -> Option<TaskState> {
        self.tasks.get(&task_id).map(|n| n.task.state())
    }

    pub fn task(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.get(&task_id).map(|n| &n.task)
    }

    pub fn resolved_params(&self, task_id: TaskId) -> Option<&[ResolvedParam]> {
        self.tasks.get(&task_id).map(|n| n.resolved.as_slice())
    }

    /// Renamings read by the currently-known successors of a task, consulted
    /// by lookahead scheduling policies.
    pub fn successor_input_renamings(&self, task_id: TaskId) -> Vec<String> {
        let Some(node) = self.tasks.get(&task_id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for successor in &node.successors {
            if let Some(succ) = self.tasks.get(successor) {
                for read in &succ.reads {
                    if seen.insert(*read) {
                        out.push(read.renaming());
                    }
                }
            }
        }
        out
    }

    pub fn mark_scheduled(&mut self, task_id: TaskId) -> Result<()> {
        self.transition(task_id, TaskState::Scheduled)
    }

    pub fn mark_running(&mut self, task_id: TaskId) -> Result<()> {
        self.transition(task_id, TaskState::Running)
    }

    fn transition(&mut self, task_id: TaskId, to: TaskState) -> Result<()> {
        self.tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::Internal(format!("unknown task {task_id}")))?
            .task
            .transition(to)
    }
}

impl Default for TaskAnalyser {
    fn default() -> Self {
        Self::new()
    }
}
