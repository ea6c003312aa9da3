//! Worker execution engine
//!
//! One executor per worker runs jobs through the fetch → load → invoke →
//! store sequence, one slot per permit. Timeouts are enforced with
//! `tokio::select!`; cancellation is cooperative and checked between
//! phases. Stdio finalization failures surface as task failures.

use crate::data_manager::{DataManager, LoadedValue};
use crate::transfer::{MultiOperationFetchListener, WaitListener};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, instrument, warn};
use weft_core::{Direction, Error, ParamType, Result, StdStream, TaskId};
use weft_runtime::{
    JobCompletion, JobParam, JobPayload, JobRequest, JobStatus, ProducedData, ProfilingRecord,
    SourceUri,
};

/// A parameter hydrated for user-code invocation.
#[derive(Debug, Clone)]
pub struct LoadedParam {
    pub name: String,
    pub param_type: ParamType,
    pub direction: Direction,
    pub stream: StdStream,
    pub prefix: Option<String>,
    pub value: LoadedValue,
}

/// A value user code produced for one output parameter.
#[derive(Debug, Clone)]
pub struct InvocationOutput {
    /// Formal parameter name the output belongs to
    pub name: String,
    pub value: OutputValue,
}

#[derive(Debug, Clone)]
pub enum OutputValue {
    /// Serialized object bytes
    Bytes(Vec<u8>),
    /// The file was written at the parameter's target path
    File,
    /// Persistent object id
    StorageId(String),
    /// Binding-object handle registered with the language binding
    Binding,
}

/// Invocation of user code inside the worker process. The language binding
/// implements this; the runtime only sees the seam.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, job: &JobRequest, params: Vec<LoadedParam>)
        -> Result<Vec<InvocationOutput>>;
}

/// Runs jobs on this worker, bounded by the slot count.
pub struct WorkerExecutor {
    manager: Arc<DataManager>,
    invoker: Arc<dyn Invoker>,
    slots: Arc<Semaphore>,
    cancelled: Arc<RwLock<HashSet<TaskId>>>,
}

impl WorkerExecutor {
    pub fn new(manager: Arc<DataManager>, invoker: Arc<dyn Invoker>, slots: usize) -> Self {
        Self {
            manager,
            invoker,
            slots: Arc::new(Semaphore::new(slots.max(1))),
            cancelled: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn manager(&self) -> &Arc<DataManager> {
        &self.manager
    }

    /// Request cooperative cancellation of a job. Takes effect at the next
    /// phase boundary.
    pub async fn cancel(&self, task_id: TaskId) {
        self.cancelled.write().await.insert(task_id);
        info!(task = %task_id, "Cancellation requested");
    }

    async fn is_cancelled(&self, task_id: TaskId) -> bool {
        self.cancelled.read().await.contains(&task_id)
    }

    /// Run one job to completion. Always returns a completion message; the
    /// caller reports it to the master.
    #[instrument(
        skip(self, job),
        fields(
            task = %job.task_id,
            attempt = job.attempt,
            signature = %job.signature,
        )
    )]
    pub async fn execute(&self, job: JobRequest) -> JobCompletion {
        let _permit = self
            .slots
            .acquire()
            .await
            .expect("executor slot semaphore closed");
        let start = Instant::now();
        let bytes_before = self.manager.transferred_bytes();
        let task_id = job.task_id;

        let result = match job.implementation.timeout_ms {
            Some(timeout_ms) => {
                tokio::select! {
                    result = self.run(&job) => result,
                    _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                        warn!(timeout_ms, "Execution budget exceeded");
                        Err(Error::Timeout(format!(
                            "task {task_id} exceeded its {timeout_ms} ms budget"
                        )))
                    }
                }
            }
            None => self.run(&job).await,
        };

        let was_cancelled = self.is_cancelled(task_id).await;
        self.cancelled.write().await.remove(&task_id);

        let profile = ProfilingRecord {
            wall_ms: start.elapsed().as_millis() as u64,
            transferred_bytes: self.manager.transferred_bytes() - bytes_before,
        };

        let status = match &result {
            Ok(_) => JobStatus::Done,
            Err(_) if was_cancelled => JobStatus::Cancelled,
            Err(error) => JobStatus::failed_from(error),
        };
        let produced = result.unwrap_or_default();

        debug!(?status, wall_ms = profile.wall_ms, "Job finished");
        JobCompletion {
            task_id,
            attempt: job.attempt,
            worker: self.manager.worker_id().clone(),
            status,
            produced,
            profile,
        }
    }

    async fn run(&self, job: &JobRequest) -> Result<Vec<ProducedData>> {
        self.manager.remove_obsoletes(&job.obsoletes);

        let sandbox = self.manager.absolute(&job.sandbox);
        std::fs::create_dir_all(&sandbox)
            .map_err(|e| Error::Internal(format!("creating sandbox: {e}")))?;

        self.check_cancelled(job.task_id).await?;

        // Fetch every parameter; the composite listener completes when all
        // children do.
        let (wait, ready) = WaitListener::new();
        let fetch_group = Arc::new(MultiOperationFetchListener::new(
            format!("job-{}", job.task_id),
            wait,
        ));
        for (index, param) in job.params.iter().enumerate() {
            fetch_group.add_operation();
            self.manager.fetch_param(param, index, fetch_group.clone());
        }
        fetch_group.enable();
        ready
            .await
            .map_err(|_| Error::Internal("fetch listener dropped".into()))??;

        self.check_cancelled(job.task_id).await?;

        // Rehydrate values just before execution
        let mut params = Vec::with_capacity(job.params.len());
        for param in &job.params {
            params.push(LoadedParam {
                name: param.name.clone(),
                param_type: param.param_type,
                direction: param.direction,
                stream: param.stream,
                prefix: param.prefix.clone(),
                value: self.manager.load_param(param).await?,
            });
        }

        self.check_cancelled(job.task_id).await?;

        let outputs = self.invoker.invoke(job, params).await?;

        let produced = self.store_outputs(job, outputs)?;
        self.finalize_streams(job)?;
        Ok(produced)
    }

    async fn check_cancelled(&self, task_id: TaskId) -> Result<()> {
        if self.is_cancelled(task_id).await {
            Err(Error::TaskFailure(format!("task {task_id} cancelled")))
        } else {
            Ok(())
        }
    }

    /// Publish produced values into the registry and report them upstream.
    fn store_outputs(
        &self,
        job: &JobRequest,
        outputs: Vec<InvocationOutput>,
    ) -> Result<Vec<ProducedData>> {
        let mut by_name: HashMap<&str, &OutputValue> =
            outputs.iter().map(|o| (o.name.as_str(), &o.value)).collect();
        let mut produced = Vec::new();
        for param in &job.params {
            self.store_param(param, &mut by_name, &mut produced)?;
        }
        Ok(produced)
    }

    fn store_param(
        &self,
        param: &JobParam,
        by_name: &mut HashMap<&str, &OutputValue>,
        produced: &mut Vec<ProducedData>,
    ) -> Result<()> {
        for element in &param.elements {
            self.store_param(element, by_name, produced)?;
        }
        let Some(target) = &param.target_renaming else {
            return Ok(());
        };

        match param.param_type {
            ParamType::Object => {
                let Some(OutputValue::Bytes(bytes)) = by_name.remove(param.name.as_str()) else {
                    return Err(Error::TaskFailure(format!(
                        "output object '{}' was not produced",
                        param.name
                    )));
                };
                self.manager.store_value(target, bytes.clone());
                produced.push(ProducedData {
                    renaming: target.clone(),
                    size_bytes: bytes.len() as u64,
                    uri: SourceUri::Object,
                });
            }
            ParamType::File | ParamType::Collection => {
                let JobPayload::File(path) = &param.payload else {
                    return Err(Error::Internal("file parameter without path".into()));
                };
                let absolute = self.manager.absolute(path);
                if !absolute.exists() {
                    return Err(Error::TaskFailure(format!(
                        "output file '{}' missing at {}",
                        param.name,
                        absolute.display()
                    )));
                }
                let size_bytes = std::fs::metadata(&absolute).map(|m| m.len()).unwrap_or(0);
                self.manager.store_file(target, &absolute);
                produced.push(ProducedData {
                    renaming: target.clone(),
                    size_bytes,
                    uri: SourceUri::File(absolute),
                });
            }
            ParamType::BindingObject => {
                self.manager.store_binding(target);
                produced.push(ProducedData {
                    renaming: target.clone(),
                    size_bytes: 0,
                    uri: SourceUri::Binding(target.clone()),
                });
            }
            ParamType::Psco | ParamType::ExternalPsco => {
                if let Some(OutputValue::StorageId(id)) = by_name.remove(param.name.as_str()) {
                    produced.push(ProducedData {
                        renaming: target.clone(),
                        size_bytes: 0,
                        uri: SourceUri::Storage(id.clone()),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Flush stdout/stderr-bound files; a failure here counts as a task
    /// failure.
    fn finalize_streams(&self, job: &JobRequest) -> Result<()> {
        for param in &job.params {
            if !matches!(param.stream, StdStream::Stdout | StdStream::Stderr) {
                continue;
            }
            let JobPayload::File(path) = &param.payload else {
                continue;
            };
            let absolute = self.manager.absolute(path);
            if !absolute.exists() {
                continue;
            }
            sync_file(&absolute).map_err(|e| {
                Error::StreamClose(format!("finalizing {}: {e}", absolute.display()))
            })?;
        }
        Ok(())
    }
}

fn sync_file(path: &Path) -> std::io::Result<()> {
    std::fs::OpenOptions::new().append(true).open(path)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_manager::DataManagerConfig;
    use crate::transfer::{DataProvider, FetchedValue, TransferRequest};
    use weft_core::{Implementation, ResourceDescription, WorkerId};

    struct NullProvider;

    #[async_trait]
    impl DataProvider for NullProvider {
        async fn ask_for_transfer(&self, request: TransferRequest) -> Result<FetchedValue> {
            Err(Error::Transfer(format!("no sources for {}", request.renaming)))
        }
    }

    /// Copies input file contents into output files, uppercased.
    struct UppercaseInvoker;

    #[async_trait]
    impl Invoker for UppercaseInvoker {
        async fn invoke(
            &self,
            _job: &JobRequest,
            params: Vec<LoadedParam>,
        ) -> Result<Vec<InvocationOutput>> {
            let mut input = Vec::new();
            for param in &params {
                if param.direction == Direction::In {
                    if let LoadedValue::Path(path) = &param.value {
                        input = std::fs::read(path)
                            .map_err(|e| Error::TaskFailure(e.to_string()))?;
                    }
                }
            }
            for param in &params {
                if param.direction == Direction::Out {
                    if let LoadedValue::Path(path) = &param.value {
                        std::fs::write(path, input.to_ascii_uppercase())
                            .map_err(|e| Error::TaskFailure(e.to_string()))?;
                        return Ok(vec![InvocationOutput {
                            name: param.name.clone(),
                            value: OutputValue::File,
                        }]);
                    }
                }
            }
            Ok(Vec::new())
        }
    }

    struct SleepyInvoker;

    #[async_trait]
    impl Invoker for SleepyInvoker {
        async fn invoke(
            &self,
            _job: &JobRequest,
            _params: Vec<LoadedParam>,
        ) -> Result<Vec<InvocationOutput>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    fn job(params: Vec<JobParam>, timeout_ms: Option<u64>) -> JobRequest {
        let mut implementation =
            Implementation::new("test(FILE_T)", ResourceDescription::new(1, 64));
        if let Some(ms) = timeout_ms {
            implementation = implementation.with_timeout_ms(ms);
        }
        JobRequest {
            task_id: TaskId(1),
            attempt: 0,
            signature: "test(FILE_T)".into(),
            implementation,
            params,
            sandbox: "jobs/t1_a0".into(),
            obsoletes: Vec::new(),
            priority: 0,
        }
    }

    fn file_param(name: &str, direction: Direction, renaming: &str) -> JobParam {
        JobParam {
            name: name.into(),
            param_type: ParamType::File,
            direction,
            stream: StdStream::Unspecified,
            prefix: None,
            source_renaming: matches!(direction, Direction::In).then(|| renaming.to_string()),
            target_renaming: matches!(direction, Direction::Out).then(|| renaming.to_string()),
            sources: Vec::new(),
            payload: JobPayload::File(renaming.into()),
            preserve_source: direction.preserve_source(),
            elements: Vec::new(),
        }
    }

    fn executor(invoker: Arc<dyn Invoker>) -> (WorkerExecutor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(DataManager::new(
            WorkerId::new("w1"),
            dir.path(),
            Arc::new(NullProvider),
            None,
            DataManagerConfig::default(),
        ));
        (WorkerExecutor::new(manager, invoker, 2), dir)
    }

    #[tokio::test]
    async fn test_execute_happy_path() {
        let (executor, dir) = executor(Arc::new(UppercaseInvoker));
        std::fs::write(dir.path().join("d1_v1"), b"hello").unwrap();
        executor
            .manager()
            .store_file("d1_v1", dir.path().join("d1_v1"));

        let completion = executor
            .execute(job(
                vec![
                    file_param("in", Direction::In, "d1_v1"),
                    file_param("out", Direction::Out, "d2_v2"),
                ],
                None,
            ))
            .await;

        assert_eq!(completion.status, JobStatus::Done);
        assert_eq!(completion.produced.len(), 1);
        assert_eq!(completion.produced[0].renaming, "d2_v2");
        assert_eq!(std::fs::read(dir.path().join("d2_v2")).unwrap(), b"HELLO");
    }

    #[tokio::test]
    async fn test_missing_input_fails_with_transfer_error() {
        let (executor, _dir) = executor(Arc::new(UppercaseInvoker));
        let completion = executor
            .execute(job(vec![file_param("in", Direction::In, "d9_v1")], None))
            .await;
        match completion.status {
            JobStatus::Failed { retriable, .. } => assert!(retriable),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_enforced() {
        let (executor, _dir) = executor(Arc::new(SleepyInvoker));
        let completion = executor.execute(job(Vec::new(), Some(50))).await;
        match completion.status {
            JobStatus::Failed { error, retriable, .. } => {
                assert!(error.contains("budget"));
                assert!(retriable);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_output_is_task_failure() {
        struct NoopInvoker;
        #[async_trait]
        impl Invoker for NoopInvoker {
            async fn invoke(
                &self,
                _job: &JobRequest,
                _params: Vec<LoadedParam>,
            ) -> Result<Vec<InvocationOutput>> {
                Ok(Vec::new())
            }
        }

        let (executor, _dir) = executor(Arc::new(NoopInvoker));
        let completion = executor
            .execute(job(vec![file_param("out", Direction::Out, "d2_v2")], None))
            .await;
        match completion.status {
            JobStatus::Failed { error, .. } => assert!(error.contains("missing")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_before_invoke() {
        let (executor, _dir) = executor(Arc::new(SleepyInvoker));
        executor.cancel(TaskId(1)).await;
        let completion = executor.execute(job(Vec::new(), None)).await;
        assert_eq!(completion.status, JobStatus::Cancelled);
    }
}
