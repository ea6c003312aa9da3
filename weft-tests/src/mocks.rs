//! In-process workers and a loopback data plane
//!
//! [`InProcessWorker`] implements the worker-agent seam by running a real
//! [`WorkerExecutor`] in the test process; [`DataPlane`] lets workers pull
//! renamings from each other's data managers, standing in for a network
//! transport.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use weft_core::{Error, Result, ResourceDescription, TaskId, WorkerId};
use weft_runtime::{JobRequest, SourceUri, Weft, WorkerAgent};
use weft_worker::{
    DataManager, DataManagerConfig, DataProvider, FetchedValue, InvocationOutput, Invoker,
    LoadedParam, TransferRequest, WorkerExecutor,
};

/// Shared view of every worker's data manager, used as the transfer
/// backend.
#[derive(Default)]
pub struct DataPlane {
    managers: Mutex<HashMap<WorkerId, Arc<DataManager>>>,
}

impl DataPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, id: WorkerId, manager: Arc<DataManager>) {
        self.managers.lock().unwrap().insert(id, manager);
    }

    fn get(&self, id: &WorkerId) -> Option<Arc<DataManager>> {
        self.managers.lock().unwrap().get(id).cloned()
    }

    /// Look up a worker's data manager, e.g. to assert on produced values.
    pub fn manager(&self, id: &WorkerId) -> Option<Arc<DataManager>> {
        self.get(id)
    }
}

/// Transfer provider that pulls renamings from peer workers on the plane.
struct PlaneProvider {
    plane: Arc<DataPlane>,
    self_id: WorkerId,
}

#[async_trait]
impl DataProvider for PlaneProvider {
    async fn ask_for_transfer(&self, request: TransferRequest) -> Result<FetchedValue> {
        for source in &request.sources {
            if source.worker == self.self_id {
                continue;
            }
            let Some(peer) = self.plane.get(&source.worker) else {
                continue;
            };
            match peer.get_object(&request.renaming).await {
                Ok(bytes) => {
                    return match request.target_path {
                        Some(path) => {
                            std::fs::write(&path, &bytes)
                                .map_err(|e| Error::Transfer(e.to_string()))?;
                            Ok(FetchedValue::File(path))
                        }
                        None => Ok(FetchedValue::Bytes(bytes)),
                    };
                }
                Err(e) => {
                    tracing::debug!(renaming = %request.renaming, source = %source.worker, error = %e, "Source unusable");
                }
            }
        }
        Err(Error::Transfer(format!(
            "no usable sources for {}",
            request.renaming
        )))
    }
}

/// Ordered record of observable test events.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

type InvokeFn = dyn Fn(&JobRequest, Vec<LoadedParam>) -> Result<Vec<InvocationOutput>>
    + Send
    + Sync;

/// Invoker driven by a test closure.
pub struct FnInvoker {
    function: Box<InvokeFn>,
}

impl FnInvoker {
    pub fn new(
        function: impl Fn(&JobRequest, Vec<LoadedParam>) -> Result<Vec<InvocationOutput>>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            function: Box::new(function),
        })
    }
}

#[async_trait]
impl Invoker for FnInvoker {
    async fn invoke(
        &self,
        job: &JobRequest,
        params: Vec<LoadedParam>,
    ) -> Result<Vec<InvocationOutput>> {
        // Yield once so concurrently-running jobs interleave
        tokio::task::yield_now().await;
        (self.function)(job, params)
    }
}

/// A worker agent running a real executor inside the test process.
pub struct InProcessWorker {
    id: WorkerId,
    kind: String,
    resources: ResourceDescription,
    executor: Arc<WorkerExecutor>,
    runtime: Weft,
    _dir: tempfile::TempDir,
}

impl InProcessWorker {
    /// Build a worker, register its manager on the plane and hand it to the
    /// runtime with [`Weft::add_worker`].
    pub fn build(
        name: &str,
        kind: &str,
        resources: ResourceDescription,
        plane: &Arc<DataPlane>,
        runtime: &Weft,
        invoker: Arc<dyn Invoker>,
    ) -> Arc<Self> {
        let id = WorkerId::new(name);
        let dir = tempfile::tempdir().expect("worker scratch dir");
        let provider = Arc::new(PlaneProvider {
            plane: plane.clone(),
            self_id: id.clone(),
        });
        let manager = Arc::new(DataManager::new(
            id.clone(),
            dir.path(),
            provider,
            None,
            DataManagerConfig::default(),
        ));
        plane.register(id.clone(), manager.clone());
        let slots = resources.cores as usize;
        Arc::new(Self {
            id,
            kind: kind.to_string(),
            resources,
            executor: Arc::new(WorkerExecutor::new(manager, invoker, slots)),
            runtime: runtime.clone(),
            _dir: dir,
        })
    }

    pub fn manager(&self) -> &Arc<DataManager> {
        self.executor.manager()
    }

    /// Stage a file under this worker's data directory and register it with
    /// the master as pre-existing input data.
    pub async fn seed_file(&self, user_path: &str, bytes: &[u8]) -> Result<()> {
        let manager = self.executor.manager();
        // The seeded value backs version 1 of the data
        let staged = manager.base_dir().join("seed").join(
            std::path::Path::new(user_path)
                .file_name()
                .expect("seed file name"),
        );
        std::fs::create_dir_all(staged.parent().unwrap())
            .map_err(|e| Error::Internal(e.to_string()))?;
        std::fs::write(&staged, bytes).map_err(|e| Error::Internal(e.to_string()))?;

        let instance = self
            .runtime
            .register_data(
                weft_core::ParameterValue::File(user_path.into()),
                self.id.clone(),
                SourceUri::File(staged.clone()),
                bytes.len() as u64,
            )
            .await?;
        manager.store_file(&instance.renaming(), &staged);
        Ok(())
    }
}

#[async_trait]
impl WorkerAgent for InProcessWorker {
    fn id(&self) -> WorkerId {
        self.id.clone()
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn resources(&self) -> ResourceDescription {
        self.resources
    }

    async fn submit(&self, job: JobRequest) -> Result<()> {
        let executor = self.executor.clone();
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            let completion = executor.execute(job).await;
            let _ = runtime.notify_completion(completion).await;
        });
        Ok(())
    }

    async fn cancel(&self, task_id: TaskId) -> Result<()> {
        self.executor.cancel(task_id).await;
        Ok(())
    }
}
