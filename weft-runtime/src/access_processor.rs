//! The dispatcher: a single-threaded event loop owning the DAG state
//!
//! Public entry points push typed request messages onto a bounded channel
//! and block on oneshot completions where synchronous semantics are needed
//! (barriers, blocking reads). The dispatcher task is the sole writer of the
//! analyser, the data registry and the scheduling structures, which keeps
//! the hot path lock-free. Suspension happens only between event handlings,
//! never mid-handler.

use crate::agent::{
    DataSource, JobCompletion, JobParam, JobPayload, JobRequest, JobStatus, SourceUri, WorkerAgent,
};
use crate::data_info::DataInfoProvider;
use crate::metrics;
use crate::task_analyser::{EndOutcome, ResolvedParam, TaskAnalyser};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use weft_core::{
    AccessMode, DataId, DataInstanceId, Error, Parameter, ParameterValue, Result, RuntimeConfig,
    TaskDescription, TaskId, TaskState, WorkerId,
};
use weft_scheduler::{
    CancelDisposition, CompletionStats, InputData, Placement, SchedulableAction, SchedulerConfig,
    TaskScheduler,
};

/// Handle returned by a blocking-read request: the pinned instance plus a
/// receiver that fires once the value is produced.
#[derive(Debug)]
pub struct OpenData {
    pub instance: DataInstanceId,
    pub ready: oneshot::Receiver<Result<DataInstanceId>>,
}

enum Request {
    SubmitTask {
        description: TaskDescription,
        reply: oneshot::Sender<Result<TaskId>>,
    },
    SubmitAck {
        task_id: TaskId,
        attempt: u32,
    },
    Completion {
        completion: JobCompletion,
    },
    Barrier {
        app_id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    BarrierGroup {
        app_id: Uuid,
        group: String,
        reply: oneshot::Sender<Result<()>>,
    },
    OpenFile {
        path: PathBuf,
        mode: AccessMode,
        reply: oneshot::Sender<Result<OpenData>>,
    },
    CloseFile {
        instance: DataInstanceId,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteData {
        key: String,
        reply: oneshot::Sender<Result<()>>,
    },
    WaitForConcurrent {
        key: String,
        reply: oneshot::Sender<Result<()>>,
    },
    DataAccessed {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    RegisterData {
        value: ParameterValue,
        worker: WorkerId,
        uri: SourceUri,
        size_bytes: u64,
        reply: oneshot::Sender<Result<DataInstanceId>>,
    },
    CancelApplication {
        app_id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    CancelTask {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },
    AddWorker {
        agent: Arc<dyn WorkerAgent>,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveWorker {
        worker: WorkerId,
        reply: oneshot::Sender<Result<()>>,
    },
    DataArrived {
        renaming: String,
        worker: WorkerId,
        uri: SourceUri,
        size_bytes: u64,
    },
    TaskTimedOut {
        task_id: TaskId,
        attempt: u32,
    },
    CancelAckTimeout {
        task_id: TaskId,
        worker: WorkerId,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Public handle to a running Weft master.
///
/// Cloning is cheap; all clones feed the same dispatcher. Submissions block
/// when the bounded request queue is at its high-water mark.
#[derive(Clone)]
pub struct Weft {
    tx: mpsc::Sender<Request>,
}

impl Weft {
    /// Start the dispatcher with the given configuration. The returned join
    /// handle resolves when the runtime has shut down.
    pub fn start(config: RuntimeConfig) -> (Weft, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.submission_queue_depth);
        let scheduler = TaskScheduler::new(
            config.scheduler_policy,
            SchedulerConfig {
                starvation_wait: config.starvation_wait,
                starvation_bump: config.starvation_bump,
                max_priority_bump: 10,
            },
        );
        let processor = AccessProcessor {
            config,
            dip: DataInfoProvider::new(),
            analyser: TaskAnalyser::new(),
            scheduler,
            agents: HashMap::new(),
            source_uris: HashMap::new(),
            pending_obsoletes: HashMap::new(),
            placed_on: HashMap::new(),
            fault_counts: HashMap::new(),
            cancel_pending: HashMap::new(),
            delete_waiters: HashMap::new(),
            tx: tx.clone(),
            rx,
        };
        let handle = tokio::spawn(processor.run());
        (Weft { tx }, handle)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| Error::Internal("runtime stopped".into()))?;
        rx.await
            .map_err(|_| Error::Internal("runtime stopped".into()))
    }

    /// Submit a task for asynchronous execution.
    pub async fn submit_task(&self, description: TaskDescription) -> Result<TaskId> {
        self.request(|reply| Request::SubmitTask { description, reply })
            .await?
    }

    /// Block until every task of the application is terminal.
    pub async fn barrier(&self, app_id: Uuid) -> Result<()> {
        self.request(|reply| Request::Barrier { app_id, reply })
            .await?
    }

    /// Barrier scoped to a task group.
    pub async fn barrier_group(&self, app_id: Uuid, group: impl Into<String>) -> Result<()> {
        let group = group.into();
        self.request(|reply| Request::BarrierGroup {
            app_id,
            group,
            reply,
        })
        .await?
    }

    /// Pin the current instance of a file for a synchronous read. The
    /// returned [`OpenData::ready`] fires once the value is produced; the
    /// caller must [`Weft::close_file`] the instance afterwards.
    pub async fn open_file(&self, path: impl Into<PathBuf>, mode: AccessMode) -> Result<OpenData> {
        let path = path.into();
        self.request(|reply| Request::OpenFile { path, mode, reply })
            .await?
    }

    /// Release an instance pinned by [`Weft::open_file`].
    pub async fn close_file(&self, instance: DataInstanceId) -> Result<()> {
        self.request(|reply| Request::CloseFile { instance, reply })
            .await?
    }

    /// Delete a piece of data. Resolves once outstanding readers drained
    /// and filesystem-level deletion is safe.
    pub async fn delete_data(&self, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        self.request(|reply| Request::DeleteData { key, reply })
            .await?
    }

    /// Wait until all concurrent-mode accesses on the data have finished.
    pub async fn wait_for_concurrent(&self, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        self.request(|reply| Request::WaitForConcurrent { key, reply })
            .await?
    }

    pub async fn data_has_been_accessed(&self, key: impl Into<String>) -> Result<bool> {
        let key = key.into();
        self.request(|reply| Request::DataAccessed { key, reply })
            .await
    }

    /// Register pre-existing data present on a worker, e.g. an input file
    /// staged there out of band.
    pub async fn register_data(
        &self,
        value: ParameterValue,
        worker: WorkerId,
        uri: SourceUri,
        size_bytes: u64,
    ) -> Result<DataInstanceId> {
        self.request(|reply| Request::RegisterData {
            value,
            worker,
            uri,
            size_bytes,
            reply,
        })
        .await?
    }

    /// Cancel every pending task of an application.
    pub async fn cancel_application(&self, app_id: Uuid) -> Result<()> {
        self.request(|reply| Request::CancelApplication { app_id, reply })
            .await?
    }

    /// Cancel one task.
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<()> {
        self.request(|reply| Request::CancelTask { task_id, reply })
            .await?
    }

    /// Register a worker agent with the resource pool.
    pub async fn add_worker(&self, agent: Arc<dyn WorkerAgent>) -> Result<()> {
        self.request(|reply| Request::AddWorker { agent, reply })
            .await?
    }

    /// Remove a worker from the pool; its queued actions are re-queued and
    /// its running actions retried or failed.
    pub async fn remove_worker(&self, worker: WorkerId) -> Result<()> {
        self.request(|reply| Request::RemoveWorker { worker, reply })
            .await?
    }

    /// Deliver a job completion. Worker agents call this for every job they
    /// were submitted, including cancelled ones.
    pub async fn notify_completion(&self, completion: JobCompletion) -> Result<()> {
        self.tx
            .send(Request::Completion { completion })
            .await
            .map_err(|_| Error::Internal("runtime stopped".into()))
    }

    /// Report that a renaming arrived on a worker (transfer finished).
    pub async fn data_arrived(
        &self,
        renaming: impl Into<String>,
        worker: WorkerId,
        uri: SourceUri,
        size_bytes: u64,
    ) -> Result<()> {
        self.tx
            .send(Request::DataArrived {
                renaming: renaming.into(),
                worker,
                uri,
                size_bytes,
            })
            .await
            .map_err(|_| Error::Internal("runtime stopped".into()))
    }

    /// Stop the dispatcher after draining queued events.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Request::Shutdown { reply }).await
    }
}

struct AccessProcessor {
    config: RuntimeConfig,
    dip: DataInfoProvider,
    analyser: TaskAnalyser,
    scheduler: TaskScheduler,
    agents: HashMap<WorkerId, Arc<dyn WorkerAgent>>,
    /// Transfer sources per renaming, mirrored from completions
    source_uris: HashMap<String, Vec<DataSource>>,
    /// Obsolete renamings awaiting piggyback delivery per worker
    pending_obsoletes: HashMap<WorkerId, Vec<String>>,
    placed_on: HashMap<TaskId, WorkerId>,
    /// Failed attempts per (task, worker); a worker that faults twice on
    /// one task is excluded from its further retries
    fault_counts: HashMap<(TaskId, WorkerId), u32>,
    /// Cancels sent to workers, awaiting acknowledgement
    cancel_pending: HashMap<TaskId, WorkerId>,
    delete_waiters: HashMap<DataId, Vec<oneshot::Sender<Result<()>>>>,
    tx: mpsc::Sender<Request>,
    rx: mpsc::Receiver<Request>,
}

impl AccessProcessor {
    async fn run(mut self) {
        info!(policy = self.scheduler.policy_name(), "Dispatcher started");
        while let Some(request) = self.rx.recv().await {
            if let Request::Shutdown { reply } = request {
                info!("Dispatcher shutting down");
                let _ = reply.send(());
                break;
            }
            self.handle(request);
            self.drain_delete_waiters();
            metrics::READY_QUEUE_DEPTH.set(self.scheduler.ready_count() as i64);
            metrics::WORKER_POOL_SIZE.set(self.scheduler.worker_count() as i64);
        }
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::SubmitTask { description, reply } => {
                let _ = reply.send(self.handle_submit(description));
            }
            Request::SubmitAck { task_id, attempt } => self.handle_submit_ack(task_id, attempt),
            Request::Completion { completion } => self.handle_completion(completion),
            Request::Barrier { app_id, reply } => self.analyser.barrier(app_id, reply),
            Request::BarrierGroup {
                app_id,
                group,
                reply,
            } => self.analyser.barrier_group(app_id, group, reply),
            Request::OpenFile { path, mode, reply } => {
                let _ = reply.send(self.handle_open_file(path, mode));
            }
            Request::CloseFile { instance, reply } => {
                let _ = reply.send(self.dip.finish_access(instance));
            }
            Request::DeleteData { key, reply } => self.handle_delete_data(key, reply),
            Request::WaitForConcurrent { key, reply } => {
                match self.dip.resolve(&key) {
                    Some(data_id) => {
                        self.analyser
                            .find_waited_concurrent(data_id, &self.dip, reply);
                    }
                    None => {
                        let _ = reply.send(Err(Error::UnknownData(key)));
                    }
                }
            }
            Request::DataAccessed { key, reply } => {
                let _ = reply.send(self.dip.data_has_been_accessed(&key));
            }
            Request::RegisterData {
                value,
                worker,
                uri,
                size_bytes,
                reply,
            } => {
                let _ = reply.send(self.handle_register_data(value, worker, uri, size_bytes));
            }
            Request::CancelApplication { app_id, reply } => {
                let _ = reply.send(self.handle_cancel_application(app_id));
            }
            Request::CancelTask { task_id, reply } => {
                let _ = reply.send(self.handle_cancel_task(task_id));
            }
            Request::AddWorker { agent, reply } => {
                let _ = reply.send(self.handle_add_worker(agent));
            }
            Request::RemoveWorker { worker, reply } => {
                let _ = reply.send(self.handle_remove_worker(&worker));
            }
            Request::DataArrived {
                renaming,
                worker,
                uri,
                size_bytes,
            } => self.handle_data_arrived(renaming, worker, uri, size_bytes),
            Request::TaskTimedOut { task_id, attempt } => {
                self.handle_task_timed_out(task_id, attempt)
            }
            Request::CancelAckTimeout { task_id, worker } => {
                self.handle_cancel_ack_timeout(task_id, worker)
            }
            Request::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    fn handle_submit(&mut self, description: TaskDescription) -> Result<TaskId> {
        let processed = match self.analyser.process_task(description, &mut self.dip) {
            Ok(p) => p,
            Err(e) => {
                metrics::TASKS_SUBMITTED_TOTAL
                    .with_label_values(&["rejected"])
                    .inc();
                return Err(e);
            }
        };
        metrics::TASKS_SUBMITTED_TOTAL
            .with_label_values(&["accepted"])
            .inc();
        if processed.ready {
            let action = self.build_action(processed.task_id);
            let placements = self.scheduler.submit_action(action);
            self.execute_placements(placements);
        }
        Ok(processed.task_id)
    }

    fn handle_submit_ack(&mut self, task_id: TaskId, attempt: u32) {
        let current = self.analyser.task(task_id).map(|t| t.attempt);
        if current != Some(attempt) {
            return;
        }
        if self.analyser.task_state(task_id) == Some(TaskState::Scheduled) {
            if let Err(e) = self.analyser.mark_running(task_id) {
                warn!(task = %task_id, error = %e, "Failed to mark task running");
            }
        }
    }

    // ------------------------------------------------------------------
    // Completion, retry, timeout
    // ------------------------------------------------------------------

    fn handle_completion(&mut self, completion: JobCompletion) {
        let JobCompletion {
            task_id,
            attempt,
            worker,
            status,
            produced,
            profile,
        } = completion;

        let state = self.analyser.task_state(task_id);
        let current_attempt = self.analyser.task(task_id).map(|t| t.attempt);

        // Acknowledgement of a cancelled or already-settled attempt: free
        // the worker's resources, nothing else.
        if state.map(|s| s.is_terminal()).unwrap_or(true) || current_attempt != Some(attempt) {
            debug!(task = %task_id, attempt, "Late or cancelled completion");
            self.cancel_pending.remove(&task_id);
            self.placed_on.remove(&task_id);
            let placements = self.scheduler.action_removed(task_id, &worker);
            self.execute_placements(placements);
            return;
        }

        self.placed_on.remove(&task_id);
        let mut placements = Vec::new();
        let success = matches!(status, JobStatus::Done);

        match self.scheduler.action_completed(
            task_id,
            &worker,
            CompletionStats {
                wall_ms: profile.wall_ms,
                transferred_bytes: profile.transferred_bytes,
                success,
            },
        ) {
            Ok(more) => placements.extend(more),
            Err(e) => warn!(task = %task_id, error = %e, "Completion for untracked action"),
        }

        metrics::TASK_WALL_SECONDS
            .with_label_values(&[if success { "done" } else { "failed" }])
            .observe(profile.wall_ms as f64 / 1000.0);

        match status {
            JobStatus::Done => {
                for data in &produced {
                    self.scheduler.locations_mut().add(
                        &data.renaming,
                        worker.clone(),
                        data.size_bytes,
                    );
                    self.source_uris
                        .entry(data.renaming.clone())
                        .or_default()
                        .push(DataSource {
                            worker: worker.clone(),
                            uri: data.uri.clone(),
                        });
                }
                metrics::TASKS_COMPLETED_TOTAL
                    .with_label_values(&["done"])
                    .inc();
                self.fault_counts.retain(|(t, _), _| *t != task_id);
                match self.analyser.end_task(task_id, true, &mut self.dip) {
                    Ok(outcome) => placements.extend(self.apply_end_outcome(outcome)),
                    Err(e) => return self.fail_fatal(e),
                }
            }
            JobStatus::Failed {
                error,
                retriable,
                host_sticky,
            } => {
                warn!(task = %task_id, attempt, %error, "Task attempt failed");
                let faults = self
                    .fault_counts
                    .entry((task_id, worker.clone()))
                    .or_insert(0);
                *faults += 1;
                let repeat_offender = *faults >= 2;
                let budget_left = attempt < self.config.max_retries;
                if retriable && budget_left {
                    metrics::TASKS_COMPLETED_TOTAL
                        .with_label_values(&["retried"])
                        .inc();
                    let exclude = (host_sticky || repeat_offender).then(|| worker.clone());
                    if let Err(e) = self.analyser.retry_task(task_id, exclude) {
                        return self.fail_fatal(e);
                    }
                    let action = self.build_action(task_id);
                    placements.extend(self.scheduler.submit_action(action));
                } else {
                    metrics::TASKS_COMPLETED_TOTAL
                        .with_label_values(&["failed"])
                        .inc();
                    self.fault_counts.retain(|(t, _), _| *t != task_id);
                    match self.analyser.end_task(task_id, false, &mut self.dip) {
                        Ok(outcome) => placements.extend(self.apply_end_outcome(outcome)),
                        Err(e) => return self.fail_fatal(e),
                    }
                }
            }
            JobStatus::Cancelled => {
                metrics::TASKS_COMPLETED_TOTAL
                    .with_label_values(&["cancelled"])
                    .inc();
                match self.analyser.cancel_task(task_id, &mut self.dip) {
                    Ok(outcome) => placements.extend(self.apply_end_outcome(outcome)),
                    Err(e) => return self.fail_fatal(e),
                }
            }
        }

        self.collect_obsoletes();
        self.execute_placements(placements);
    }

    /// Feed newly-ready successors to the scheduler and purge cancelled ones.
    fn apply_end_outcome(&mut self, outcome: EndOutcome) -> Vec<Placement> {
        let mut placements = Vec::new();
        for cancelled in &outcome.cancelled {
            if let CancelDisposition::PlacedOn(worker) = self.scheduler.cancel(*cancelled) {
                self.send_cancel(*cancelled, worker);
            }
        }
        for ready in outcome.newly_ready {
            let action = self.build_action(ready);
            placements.extend(self.scheduler.submit_action(action));
        }
        placements
    }

    fn handle_task_timed_out(&mut self, task_id: TaskId, attempt: u32) {
        let current_attempt = self.analyser.task(task_id).map(|t| t.attempt);
        let state = self.analyser.task_state(task_id);
        let running = matches!(state, Some(TaskState::Scheduled | TaskState::Running));
        if current_attempt != Some(attempt) || !running {
            return;
        }
        let Some(worker) = self.placed_on.remove(&task_id) else {
            return;
        };
        warn!(task = %task_id, attempt, worker = %worker, "Task exceeded its execution budget");

        // Tear down the worker-side attempt; its late completion is ignored.
        if let Some(agent) = self.agents.get(&worker).cloned() {
            tokio::spawn(async move {
                let _ = agent.cancel(task_id).await;
            });
        }
        let mut placements = self.scheduler.action_removed(task_id, &worker);

        let budget_left = attempt < self.config.max_retries;
        if budget_left {
            metrics::TASKS_COMPLETED_TOTAL
                .with_label_values(&["retried"])
                .inc();
            if let Err(e) = self.analyser.retry_task(task_id, None) {
                return self.fail_fatal(e);
            }
            let action = self.build_action(task_id);
            placements.extend(self.scheduler.submit_action(action));
        } else {
            metrics::TASKS_COMPLETED_TOTAL
                .with_label_values(&["failed"])
                .inc();
            match self.analyser.end_task(task_id, false, &mut self.dip) {
                Ok(outcome) => placements.extend(self.apply_end_outcome(outcome)),
                Err(e) => return self.fail_fatal(e),
            }
        }
        self.collect_obsoletes();
        self.execute_placements(placements);
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    fn handle_cancel_task(&mut self, task_id: TaskId) -> Result<()> {
        match self.scheduler.cancel(task_id) {
            CancelDisposition::PlacedOn(worker) => {
                self.send_cancel(task_id, worker);
                let outcome = self.analyser.cancel_task(task_id, &mut self.dip)?;
                let placements = self.apply_end_outcome(outcome);
                self.execute_placements(placements);
            }
            CancelDisposition::Dequeued | CancelDisposition::Unknown => {
                let outcome = self.analyser.cancel_task(task_id, &mut self.dip)?;
                let placements = self.apply_end_outcome(outcome);
                self.execute_placements(placements);
            }
        }
        self.collect_obsoletes();
        Ok(())
    }

    fn handle_cancel_application(&mut self, app_id: Uuid) -> Result<()> {
        let (outcome, _on_worker) = self.analyser.cancel_application(app_id, &mut self.dip)?;
        let mut placements = Vec::new();
        for cancelled in &outcome.cancelled {
            if let CancelDisposition::PlacedOn(worker) = self.scheduler.cancel(*cancelled) {
                self.send_cancel(*cancelled, worker);
            }
        }
        for ready in outcome.newly_ready {
            let action = self.build_action(ready);
            placements.extend(self.scheduler.submit_action(action));
        }
        info!(app = %app_id, cancelled = outcome.cancelled.len(), "Application cancelled");
        self.collect_obsoletes();
        self.execute_placements(placements);
        Ok(())
    }

    /// Fire-and-forget cancel with an acknowledgement timeout. A worker that
    /// never acks within the timeout is considered degraded and removed.
    fn send_cancel(&mut self, task_id: TaskId, worker: WorkerId) {
        self.cancel_pending.insert(task_id, worker.clone());
        if let Some(agent) = self.agents.get(&worker).cloned() {
            tokio::spawn(async move {
                let _ = agent.cancel(task_id).await;
            });
        }
        let tx = self.tx.clone();
        let timeout = self.config.cancel_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Request::CancelAckTimeout { task_id, worker }).await;
        });
    }

    fn handle_cancel_ack_timeout(&mut self, task_id: TaskId, worker: WorkerId) {
        if self.cancel_pending.remove(&task_id).is_none() {
            return; // acked in time
        }
        warn!(task = %task_id, worker = %worker, "Cancel unacknowledged; degrading worker");
        if let Err(e) = self.handle_remove_worker(&worker) {
            warn!(worker = %worker, error = %e, "Degraded worker removal failed");
        }
    }

    // ------------------------------------------------------------------
    // Worker pool
    // ------------------------------------------------------------------

    fn handle_add_worker(&mut self, agent: Arc<dyn WorkerAgent>) -> Result<()> {
        let id = agent.id();
        let kind = agent.kind().to_string();
        let resources = agent.resources();
        if self.agents.contains_key(&id) {
            return Err(Error::Submission(format!("worker {id} already registered")));
        }
        self.agents.insert(id.clone(), agent);
        let placements = self
            .scheduler
            .worker_added(id, kind, resources)
            .map_err(|e| Error::Internal(e.to_string()))?;
        self.execute_placements(placements);
        Ok(())
    }

    fn handle_remove_worker(&mut self, worker: &WorkerId) -> Result<()> {
        self.agents.remove(worker);
        self.pending_obsoletes.remove(worker);
        self.source_uris.retain(|_, sources| {
            sources.retain(|s| &s.worker != worker);
            !sources.is_empty()
        });
        let (lost, mut placements) = self
            .scheduler
            .worker_removed(worker)
            .map_err(|e| Error::Internal(e.to_string()))?;

        for action in lost {
            let task_id = action.task_id;
            if self
                .analyser
                .task_state(task_id)
                .map(|s| s.is_terminal())
                .unwrap_or(true)
            {
                continue;
            }
            self.placed_on.remove(&task_id);
            let attempt = self.analyser.task(task_id).map(|t| t.attempt).unwrap_or(0);
            if attempt < self.config.max_retries {
                if let Err(e) = self.analyser.retry_task(task_id, Some(worker.clone())) {
                    self.fail_fatal(e);
                    return Ok(());
                }
                let action = self.build_action(task_id);
                placements.extend(self.scheduler.submit_action(action));
            } else {
                match self.analyser.end_task(task_id, false, &mut self.dip) {
                    Ok(outcome) => placements.extend(self.apply_end_outcome(outcome)),
                    Err(e) => {
                        self.fail_fatal(e);
                        return Ok(());
                    }
                }
            }
        }
        self.collect_obsoletes();
        self.execute_placements(placements);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data plane events
    // ------------------------------------------------------------------

    fn handle_data_arrived(
        &mut self,
        renaming: String,
        worker: WorkerId,
        uri: SourceUri,
        size_bytes: u64,
    ) {
        self.scheduler
            .locations_mut()
            .add(&renaming, worker.clone(), size_bytes);
        self.source_uris
            .entry(renaming)
            .or_default()
            .push(DataSource { worker, uri });
        let placements = self.scheduler.rescore();
        self.execute_placements(placements);
    }

    fn handle_open_file(&mut self, path: PathBuf, mode: AccessMode) -> Result<OpenData> {
        let key = format!("file:{}", path.display());
        if mode.writes() {
            let access = self.dip.register_access(&key, mode)?;
            let instance = access
                .write
                .ok_or_else(|| Error::Internal("write access without instance".into()))?;
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Ok(instance));
            return Ok(OpenData {
                instance,
                ready: rx,
            });
        }

        let instance = if self.dip.data_has_been_accessed(&key) {
            self.dip.block_data(&key)?
        } else {
            self.dip
                .register_access(&key, AccessMode::Read)?
                .read
                .ok_or_else(|| Error::Internal("read access without instance".into()))?
        };
        let (tx, rx) = oneshot::channel();
        self.analyser
            .find_waited_task(instance.data_id, &self.dip, tx);
        Ok(OpenData {
            instance,
            ready: rx,
        })
    }

    fn handle_delete_data(&mut self, key: String, reply: oneshot::Sender<Result<()>>) {
        match self.dip.delete_data(&key) {
            Ok(data_id) => {
                self.collect_obsoletes();
                if self.dip.has_outstanding_readers(data_id) {
                    self.delete_waiters.entry(data_id).or_default().push(reply);
                } else {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn handle_register_data(
        &mut self,
        value: ParameterValue,
        worker: WorkerId,
        uri: SourceUri,
        size_bytes: u64,
    ) -> Result<DataInstanceId> {
        let key = value
            .data_key()
            .ok_or_else(|| Error::Submission("primitive values cannot be registered".into()))?;
        let access = self.dip.register_access(&key, AccessMode::Read)?;
        let instance = access
            .read
            .ok_or_else(|| Error::Internal("read access without instance".into()))?;
        let renaming = instance.renaming();
        self.scheduler
            .locations_mut()
            .add(&renaming, worker.clone(), size_bytes);
        self.source_uris
            .entry(renaming)
            .or_default()
            .push(DataSource { worker, uri });
        self.dip.finish_access(instance)?;
        Ok(instance)
    }

    fn drain_delete_waiters(&mut self) {
        let drained: Vec<DataId> = self
            .delete_waiters
            .keys()
            .copied()
            .filter(|id| !self.dip.has_outstanding_readers(*id))
            .collect();
        for data_id in drained {
            if let Some(waiters) = self.delete_waiters.remove(&data_id) {
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
        }
    }

    /// Route freshly-obsolete renamings to the workers hosting them; they
    /// ride along with the next job sent to each worker.
    fn collect_obsoletes(&mut self) {
        for renaming in self.dip.take_obsoletes() {
            for (worker, _) in self.scheduler.locations().hosts(&renaming) {
                self.pending_obsoletes
                    .entry(worker)
                    .or_default()
                    .push(renaming.clone());
            }
            self.scheduler.locations_mut().forget(&renaming);
            self.source_uris.remove(&renaming);
        }
    }

    // ------------------------------------------------------------------
    // Placement execution
    // ------------------------------------------------------------------

    fn build_action(&self, task_id: TaskId) -> SchedulableAction {
        let task = self.analyser.task(task_id).expect("action for known task");
        let resolved = self
            .analyser
            .resolved_params(task_id)
            .unwrap_or_default();
        let inputs = resolved
            .iter()
            .filter_map(|r| r.read)
            .map(|d| InputData {
                renaming: d.renaming(),
            })
            .collect();
        let successor_inputs = self
            .analyser
            .successor_input_renamings(task_id)
            .into_iter()
            .map(|renaming| InputData { renaming })
            .collect();
        SchedulableAction {
            task_id,
            signature: task.description.signature.clone(),
            priority: task.description.priority,
            submitted_at: task.submitted_at,
            attempt: task.attempt,
            excluded_workers: task.excluded_workers.clone(),
            implementations: task.description.implementations.clone(),
            inputs,
            successor_inputs,
        }
    }

    fn execute_placements(&mut self, placements: Vec<Placement>) {
        for placement in placements {
            if let Err(e) = self.dispatch_placement(&placement) {
                error!(task = %placement.task_id, error = %e, "Failed to dispatch placement");
            }
        }
    }

    fn dispatch_placement(&mut self, placement: &Placement) -> Result<()> {
        let task_id = placement.task_id;
        self.analyser.mark_scheduled(task_id)?;
        self.placed_on.insert(task_id, placement.worker.clone());
        metrics::PLACEMENTS_TOTAL
            .with_label_values(&[self.scheduler.policy_name()])
            .inc();

        let job = self.build_job(task_id, &placement.worker, placement)?;
        let attempt = job.attempt;
        let agent = self
            .agents
            .get(&placement.worker)
            .cloned()
            .ok_or_else(|| Error::WorkerUnreachable(placement.worker.to_string()))?;

        if let Some(timeout_ms) = placement.implementation.timeout_ms {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
                let _ = tx.send(Request::TaskTimedOut { task_id, attempt }).await;
            });
        }

        let tx = self.tx.clone();
        let worker = placement.worker.clone();
        tokio::spawn(async move {
            match agent.submit(job).await {
                Ok(()) => {
                    let _ = tx.send(Request::SubmitAck { task_id, attempt }).await;
                }
                Err(e) => {
                    warn!(task = %task_id, worker = %worker, error = %e, "Job delivery failed");
                    let completion = JobCompletion {
                        task_id,
                        attempt,
                        worker: worker.clone(),
                        status: JobStatus::Failed {
                            error: e.to_string(),
                            retriable: true,
                            host_sticky: true,
                        },
                        produced: Vec::new(),
                        profile: Default::default(),
                    };
                    let _ = tx.send(Request::Completion { completion }).await;
                }
            }
        });
        Ok(())
    }

    fn build_job(
        &mut self,
        task_id: TaskId,
        worker: &WorkerId,
        placement: &Placement,
    ) -> Result<JobRequest> {
        let task = self
            .analyser
            .task(task_id)
            .ok_or_else(|| Error::Internal(format!("job for unknown task {task_id}")))?;
        let resolved = self
            .analyser
            .resolved_params(task_id)
            .ok_or_else(|| Error::Internal(format!("unresolved params for {task_id}")))?;

        let mut cursor = 0;
        let mut params = Vec::with_capacity(task.description.params.len());
        for param in &task.description.params {
            params.push(self.build_job_param(param, resolved, &mut cursor)?);
        }

        let obsoletes = self
            .pending_obsoletes
            .remove(worker)
            .unwrap_or_default();

        Ok(JobRequest {
            task_id,
            attempt: task.attempt,
            signature: task.description.signature.clone(),
            implementation: placement.implementation.clone(),
            params,
            sandbox: PathBuf::from(format!("jobs/{task_id}_a{}", task.attempt)),
            obsoletes,
            priority: task.description.priority,
        })
    }

    fn build_job_param(
        &self,
        param: &Parameter,
        resolved: &[ResolvedParam],
        cursor: &mut usize,
    ) -> Result<JobParam> {
        let r = resolved
            .get(*cursor)
            .copied()
            .ok_or_else(|| Error::Internal("parameter resolution out of sync".into()))?;
        *cursor += 1;

        let source_renaming = r.read.map(|d| d.renaming());
        let target_renaming = r.write.map(|d| d.renaming());
        let sources = source_renaming
            .as_deref()
            .and_then(|renaming| self.source_uris.get(renaming).cloned())
            .unwrap_or_default();

        // The path a file-like value materializes at: the written instance
        // for producing accesses, the read instance otherwise.
        let local_name = target_renaming.clone().or_else(|| source_renaming.clone());

        let payload = match &param.value {
            ParameterValue::Boolean(v) => JobPayload::Primitive(serde_json::json!(v)),
            ParameterValue::Int(v) => JobPayload::Primitive(serde_json::json!(v)),
            ParameterValue::Long(v) => JobPayload::Primitive(serde_json::json!(v)),
            ParameterValue::Double(v) => JobPayload::Primitive(serde_json::json!(v)),
            ParameterValue::Str(v) => JobPayload::Primitive(serde_json::json!(v)),
            ParameterValue::File(_) | ParameterValue::Collection { .. } => JobPayload::File(
                PathBuf::from(local_name.clone().unwrap_or_default()),
            ),
            ParameterValue::Object { bytes, .. } => {
                if r.first_access {
                    JobPayload::Object(bytes.clone())
                } else {
                    JobPayload::None
                }
            }
            ParameterValue::Psco(id) | ParameterValue::ExternalPsco(id) => {
                JobPayload::Id(id.clone())
            }
            ParameterValue::BindingObject(name) => JobPayload::Id(name.clone()),
            ParameterValue::Stream(id) => JobPayload::Id(id.clone()),
        };

        let elements = if let ParameterValue::Collection { elements, .. } = &param.value {
            elements
                .iter()
                .map(|e| self.build_job_param(e, resolved, cursor))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        Ok(JobParam {
            name: param.name.clone(),
            param_type: param.param_type(),
            direction: param.direction,
            stream: param.stream,
            prefix: param.prefix.clone(),
            source_renaming,
            target_renaming,
            sources,
            payload,
            preserve_source: param.direction.preserve_source(),
            elements,
        })
    }

    /// Fatal invariant violation: poison the analyser, release every pending
    /// waiter with an error and refuse further submissions.
    fn fail_fatal(&mut self, error: Error) {
        error!(%error, "Fatal runtime error");
        self.analyser.poison();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use weft_core::{Direction, Implementation, ResourceDescription};

    const WAIT: Duration = Duration::from_secs(5);

    /// Agent that accepts every job and never reports back on its own;
    /// tests inject completions through the runtime handle.
    struct SilentAgent {
        id: WorkerId,
    }

    impl SilentAgent {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                id: WorkerId::new(name),
            })
        }
    }

    #[async_trait]
    impl WorkerAgent for SilentAgent {
        fn id(&self) -> WorkerId {
            self.id.clone()
        }

        fn kind(&self) -> &str {
            "cpu"
        }

        fn resources(&self) -> ResourceDescription {
            ResourceDescription::new(2, 1024)
        }

        async fn submit(&self, _job: JobRequest) -> Result<()> {
            Ok(())
        }

        async fn cancel(&self, _task_id: TaskId) -> Result<()> {
            Ok(())
        }
    }

    fn out_file_task(app_id: Uuid, signature: &str, path: &str) -> TaskDescription {
        TaskDescription {
            app_id,
            signature: signature.into(),
            implementations: vec![Implementation::new(
                signature,
                ResourceDescription::new(1, 64),
            )],
            params: vec![Parameter::new(
                path,
                Direction::Out,
                ParameterValue::File(path.into()),
            )],
            priority: 0,
            group: None,
        }
    }

    fn done(task_id: TaskId, worker: &str) -> JobCompletion {
        JobCompletion {
            task_id,
            attempt: 0,
            worker: WorkerId::new(worker),
            status: JobStatus::Done,
            produced: Vec::new(),
            profile: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_open_file_for_write_is_ready_immediately() {
        let (runtime, _handle) = Weft::start(RuntimeConfig::default());
        let open = runtime
            .open_file("/fresh.out", AccessMode::Write)
            .await
            .unwrap();
        let instance = open.ready.await.unwrap().unwrap();
        assert_eq!(instance, open.instance);
        // Pure-W first touch skips the never-observable initial version
        assert_eq!(instance.renaming(), "d1_v2");
    }

    #[tokio::test]
    async fn test_open_file_on_fresh_data_resolves_to_initial_version() {
        let (runtime, _handle) = Weft::start(RuntimeConfig::default());
        let open = runtime
            .open_file("/input.dat", AccessMode::Read)
            .await
            .unwrap();
        // No pending writer: the user's own file satisfies the read
        let instance = open.ready.await.unwrap().unwrap();
        assert_eq!(instance.renaming(), "d1_v1");

        runtime.close_file(open.instance).await.unwrap();
        // Releasing an already-released pin is logged, not fatal
        runtime.close_file(open.instance).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_file_read_waits_for_pending_producer() {
        let (runtime, _handle) = Weft::start(RuntimeConfig::default());
        runtime.add_worker(SilentAgent::new("w1")).await.unwrap();
        let app = Uuid::new_v4();

        let task_id = runtime
            .submit_task(out_file_task(app, "produce", "/r"))
            .await
            .unwrap();
        let open = runtime.open_file("/r", AccessMode::Read).await.unwrap();
        // Pinned to the producer's pending output
        assert_eq!(open.instance.renaming(), "d1_v2");

        let mut ready = open.ready;
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut ready)
                .await
                .is_err(),
            "blocking read resolved before the producer committed"
        );

        runtime.notify_completion(done(task_id, "w1")).await.unwrap();
        let committed = tokio::time::timeout(WAIT, ready)
            .await
            .expect("blocking read timed out")
            .unwrap()
            .unwrap();
        assert_eq!(committed.renaming(), "d1_v2");
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_ignored() {
        let (runtime, _handle) = Weft::start(RuntimeConfig::default());
        runtime.add_worker(SilentAgent::new("w1")).await.unwrap();
        let app = Uuid::new_v4();

        let task_id = runtime
            .submit_task(out_file_task(app, "noop", "/o1"))
            .await
            .unwrap();
        runtime.notify_completion(done(task_id, "w1")).await.unwrap();
        // A second ack for the same attempt must be swallowed
        runtime.notify_completion(done(task_id, "w1")).await.unwrap();

        tokio::time::timeout(WAIT, runtime.barrier(app))
            .await
            .expect("barrier timed out")
            .unwrap();

        // The dispatcher survived and keeps serving requests
        assert!(runtime.data_has_been_accessed("file:/o1").await.unwrap());
        runtime
            .submit_task(out_file_task(app, "later", "/o2"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_data_rejects_primitives() {
        let (runtime, _handle) = Weft::start(RuntimeConfig::default());
        let result = runtime
            .register_data(
                ParameterValue::Int(7),
                WorkerId::new("w1"),
                SourceUri::Object,
                0,
            )
            .await;
        assert!(matches!(result, Err(Error::Submission(_))));
    }

    #[tokio::test]
    async fn test_duplicate_worker_registration_is_rejected() {
        let (runtime, _handle) = Weft::start(RuntimeConfig::default());
        runtime.add_worker(SilentAgent::new("w1")).await.unwrap();
        let result = runtime.add_worker(SilentAgent::new("w1")).await;
        assert!(matches!(result, Err(Error::Submission(_))));
    }

    #[tokio::test]
    async fn test_wait_for_concurrent_on_unknown_data_errors() {
        let (runtime, _handle) = Weft::start(RuntimeConfig::default());
        let result = runtime.wait_for_concurrent("file:/never-seen").await;
        assert!(matches!(result, Err(Error::UnknownData(_))));
        assert!(!runtime
            .data_has_been_accessed("file:/never-seen")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_submission_without_implementations_is_rejected() {
        let (runtime, _handle) = Weft::start(RuntimeConfig::default());
        let mut description = out_file_task(Uuid::new_v4(), "bad", "/x");
        description.implementations.clear();
        let result = runtime.submit_task(description).await;
        assert!(matches!(result, Err(Error::Submission(_))));
    }
}
