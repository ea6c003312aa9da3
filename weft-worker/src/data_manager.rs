//! Per-worker data manager
//!
//! Satisfies the worker's data-fetch contract for each parameter before
//! execution, materializes results afterwards, and enforces
//! source-preservation semantics. Each parameter kind has its own fetch
//! contract; binding objects follow a strict fallback chain (in-process
//! cache, cached source entry, file, transfer).
//!
//! At most one transfer is in flight per renaming: duplicate requests
//! attach to the existing operation's listener list.

use crate::register::Registry;
use crate::storage::StorageBackend;
use crate::transfer::{
    DataProvider, FetchDataListener, FetchedValue, MultiOperationFetchListener, TransferRequest,
};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use weft_core::{Error, ParamType, Result, WorkerId};
use weft_runtime::{JobParam, JobPayload, SourceUri};

/// Configuration of a worker's data manager.
#[derive(Debug, Clone)]
pub struct DataManagerConfig {
    pub transfer_parallelism: usize,
    pub allow_non_atomic_move: bool,
    pub storage_conf: Option<PathBuf>,
}

impl Default for DataManagerConfig {
    fn default() -> Self {
        Self {
            transfer_parallelism: 4,
            allow_non_atomic_move: true,
            storage_conf: None,
        }
    }
}

/// A parameter value hydrated for invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadedValue {
    Bytes(Vec<u8>),
    Path(PathBuf),
    Id(String),
    Primitive(serde_json::Value),
    None,
}

pub struct DataManager {
    worker_id: WorkerId,
    base_dir: PathBuf,
    registry: Registry,
    provider: Arc<dyn DataProvider>,
    storage: Option<Arc<dyn StorageBackend>>,
    storage_conf: Option<PathBuf>,
    /// Names held by the in-process language-binding cache
    binding_cache: Mutex<HashSet<String>>,
    /// Listener lists of in-flight fetches, keyed by renaming
    inflight: Mutex<HashMap<String, Vec<Arc<dyn FetchDataListener>>>>,
    transfer_slots: Arc<Semaphore>,
    transferred_bytes: AtomicU64,
    allow_non_atomic_move: bool,
}

impl DataManager {
    pub fn new(
        worker_id: WorkerId,
        base_dir: impl Into<PathBuf>,
        provider: Arc<dyn DataProvider>,
        storage: Option<Arc<dyn StorageBackend>>,
        config: DataManagerConfig,
    ) -> Self {
        Self {
            worker_id,
            base_dir: base_dir.into(),
            registry: Registry::new(),
            provider,
            storage,
            storage_conf: config.storage_conf,
            binding_cache: Mutex::new(HashSet::new()),
            inflight: Mutex::new(HashMap::new()),
            transfer_slots: Arc::new(Semaphore::new(config.transfer_parallelism.max(1))),
            transferred_bytes: AtomicU64::new(0),
            allow_non_atomic_move: config.allow_non_atomic_move,
        }
    }

    /// Bring up the storage collaborator. PSCO support is silently disabled
    /// without configuration.
    pub async fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)
            .map_err(|e| Error::Internal(format!("creating {}: {e}", self.base_dir.display())))?;
        match (&self.storage, &self.storage_conf) {
            (Some(storage), Some(conf)) => {
                debug!(config = %conf.display(), "Initializing storage backend");
                storage.init(conf).await
            }
            _ => {
                warn!("No storage configuration; persistent object support disabled");
                Ok(())
            }
        }
    }

    pub async fn stop(&self) -> Result<()> {
        if let (Some(storage), Some(_)) = (&self.storage, &self.storage_conf) {
            storage.finish().await?;
        }
        Ok(())
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Bytes pulled from remote sources so far.
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    /// Root a job-relative path under this worker's data directory.
    pub fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// The renaming under which this parameter's value lives locally.
    fn local_renaming(param: &JobParam) -> String {
        param
            .target_renaming
            .clone()
            .or_else(|| param.source_renaming.clone())
            .unwrap_or_else(|| param.name.clone())
    }

    // ------------------------------------------------------------------
    // Fetch
    // ------------------------------------------------------------------

    /// Dispatch a fetch by parameter type. Completion is reported through
    /// the listener; duplicate fetches of one renaming attach to the
    /// in-flight operation.
    pub fn fetch_param(
        self: &Arc<Self>,
        param: &JobParam,
        index: usize,
        listener: Arc<dyn FetchDataListener>,
    ) {
        let renaming = Self::local_renaming(param);
        // Pure outputs have nothing to stage; the task produces them
        if param.source_renaming.is_none()
            && matches!(
                param.param_type,
                ParamType::File | ParamType::Object | ParamType::BindingObject | ParamType::Collection
            )
        {
            listener.fetched_value(&renaming);
            return;
        }
        match param.param_type {
            ParamType::Collection => self.fetch_collection(param, index, listener),
            ParamType::Object => self.spawn_guarded(renaming, param.clone(), index, listener),
            ParamType::File => self.spawn_guarded(renaming, param.clone(), index, listener),
            ParamType::BindingObject => {
                self.spawn_guarded(renaming, param.clone(), index, listener)
            }
            ParamType::Psco => {
                if let JobPayload::Id(psco_id) = &param.payload {
                    let register = self.registry.get_or_create(&renaming);
                    register
                        .lock()
                        .expect("register lock")
                        .set_storage_id(psco_id.clone());
                    debug!(index, renaming, psco_id, "Registered persistent object");
                }
                listener.fetched_value(&renaming);
            }
            // External persistent objects carry their id directly
            ParamType::ExternalPsco | ParamType::Stream => listener.fetched_value(&renaming),
            // Basic types require no staging
            _ => listener.fetched_value(&renaming),
        }
    }

    fn spawn_guarded(
        self: &Arc<Self>,
        renaming: String,
        param: JobParam,
        index: usize,
        listener: Arc<dyn FetchDataListener>,
    ) {
        {
            let mut inflight = self.inflight.lock().expect("inflight lock");
            if let Some(waiters) = inflight.get_mut(&renaming) {
                debug!(renaming, "Attached to in-flight fetch");
                waiters.push(listener);
                return;
            }
            inflight.insert(renaming.clone(), vec![listener]);
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = match param.param_type {
                ParamType::File => manager.fetch_file(&param, index).await,
                ParamType::Object => manager.fetch_object(&param, index).await,
                ParamType::BindingObject => manager.fetch_binding_object(&param, index).await,
                other => Err(Error::Internal(format!("unexpected fetch kind {other:?}"))),
            };
            let waiters = manager
                .inflight
                .lock()
                .expect("inflight lock")
                .remove(&renaming)
                .unwrap_or_default();
            match result {
                Ok(()) => {
                    for waiter in waiters {
                        waiter.fetched_value(&renaming);
                    }
                }
                Err(error) => {
                    for waiter in waiters {
                        waiter.error_fetching_value(&renaming, error.clone());
                    }
                }
            }
        });
    }

    /// Seed the source register from the job's location list; only sources
    /// on this host count as local.
    fn original_register(&self, param: &JobParam) -> Arc<Mutex<crate::register::DataRegister>> {
        let source = param
            .source_renaming
            .clone()
            .unwrap_or_else(|| Self::local_renaming(param));
        let fresh = !self.registry.contains(&source);
        let register = self.registry.get_or_create(&source);
        if fresh {
            let mut guard = register.lock().expect("register lock");
            for location in &param.sources {
                match &location.uri {
                    SourceUri::File(path) if location.worker == self.worker_id => {
                        guard.add_file_location(self.absolute(path));
                    }
                    SourceUri::Storage(psco_id) => {
                        guard.set_storage_id(psco_id.clone());
                    }
                    _ => {}
                }
            }
        }
        register
    }

    async fn fetch_file(&self, param: &JobParam, index: usize) -> Result<()> {
        let JobPayload::File(path) = &param.payload else {
            return Err(Error::Internal("file parameter without target path".into()));
        };
        let target = self.absolute(path);
        if target.exists() {
            info!(index, target = %target.display(), "Parameter already present");
            return Ok(());
        }

        let register = self.original_register(param);
        let locally_satisfied = {
            let mut guard = register.lock().expect("register lock");
            let sources: Vec<PathBuf> = guard.file_locations().to_vec();
            let mut done = false;
            for source in sources {
                debug!(
                    index,
                    source = %source.display(),
                    target = %target.display(),
                    preserve = param.preserve_source,
                    "Staging file locally"
                );
                let outcome = if param.preserve_source {
                    std::fs::copy(&source, &target).map(|_| ())
                } else {
                    self.move_file(&source, &target)
                };
                match outcome {
                    Ok(()) => {
                        if !param.preserve_source {
                            guard.remove_file_location(&source);
                        }
                        done = true;
                        break;
                    }
                    Err(e) => {
                        warn!(source = %source.display(), error = %e, "Local staging failed");
                    }
                }
            }
            done
        };

        if !locally_satisfied {
            info!(index, target = %target.display(), "Requesting file transfer");
            match self.transfer(param, Some(target.clone())).await? {
                FetchedValue::File(_) => {}
                FetchedValue::Bytes(bytes) => {
                    std::fs::write(&target, bytes)
                        .map_err(|e| Error::Transfer(format!("writing {}: {e}", target.display())))?;
                }
                FetchedValue::StorageId(_) => {
                    return Err(Error::Transfer("file transfer returned a storage id".into()));
                }
            }
        }

        let final_register = self.registry.get_or_create(&Self::local_renaming(param));
        final_register
            .lock()
            .expect("register lock")
            .add_file_location(target);
        Ok(())
    }

    /// Rename, falling back to a copy-and-delete when the filesystem
    /// rejects the atomic move.
    fn move_file(&self, source: &Path, target: &Path) -> std::io::Result<()> {
        match std::fs::rename(source, target) {
            Ok(()) => Ok(()),
            Err(rename_error) => {
                if !self.allow_non_atomic_move {
                    return Err(rename_error);
                }
                warn!(
                    source = %source.display(),
                    target = %target.display(),
                    "File cannot be atomically moved; copying instead"
                );
                std::fs::copy(source, target)?;
                std::fs::remove_file(source)
            }
        }
    }

    async fn fetch_object(&self, param: &JobParam, index: usize) -> Result<()> {
        let final_renaming = Self::local_renaming(param);
        let source_renaming = param
            .source_renaming
            .clone()
            .unwrap_or_else(|| final_renaming.clone());
        debug!(index, renaming = %final_renaming, "Fetching object");

        // By-value submissions carry the initial bytes inline
        if let JobPayload::Object(bytes) = &param.payload {
            let register = self.registry.get_or_create(&source_renaming);
            let mut guard = register.lock().expect("register lock");
            if guard.value().is_none() {
                guard.set_value(bytes.clone());
            }
        }

        let register = self.original_register(param);
        let local = {
            let mut guard = register.lock().expect("register lock");
            if guard.is_local() {
                if final_renaming == source_renaming {
                    guard.load_value(&source_renaming)?;
                } else {
                    let value = if param.preserve_source {
                        guard.clone_value(&source_renaming)?
                    } else {
                        guard.take_value(&source_renaming)?
                    };
                    let target = self.registry.get_or_create(&final_renaming);
                    target.lock().expect("register lock").set_value(value);
                }
                true
            } else {
                false
            }
        };
        if local {
            return Ok(());
        }

        match self.transfer(param, None).await? {
            FetchedValue::Bytes(bytes) => {
                let target = self.registry.get_or_create(&final_renaming);
                target.lock().expect("register lock").set_value(bytes);
            }
            FetchedValue::File(path) => {
                let target = self.registry.get_or_create(&final_renaming);
                target.lock().expect("register lock").add_file_location(path);
            }
            FetchedValue::StorageId(id) => {
                let target = self.registry.get_or_create(&final_renaming);
                target.lock().expect("register lock").set_storage_id(id);
            }
        }
        Ok(())
    }

    /// Binding-object fallback order is strict: in-process cache, cached
    /// source entry, file on this host, transfer. No step is skipped.
    async fn fetch_binding_object(&self, param: &JobParam, index: usize) -> Result<()> {
        let final_renaming = Self::local_renaming(param);
        debug!(index, renaming = %final_renaming, "Fetching binding object");

        // 1. Already in the binding cache
        if self
            .binding_cache
            .lock()
            .expect("binding cache lock")
            .contains(&final_renaming)
        {
            return Ok(());
        }

        // 2. A cached source entry on this host
        if self.provider.is_persistent_enabled() {
            for location in &param.sources {
                if location.worker != self.worker_id {
                    continue;
                }
                let SourceUri::Binding(source_name) = &location.uri else {
                    continue;
                };
                let mut cache = self.binding_cache.lock().expect("binding cache lock");
                if cache.contains(source_name) {
                    if param.preserve_source {
                        debug!(source = %source_name, "Cache-copying binding object");
                    } else {
                        debug!(source = %source_name, "Cache-moving binding object");
                        cache.remove(source_name);
                    }
                    cache.insert(final_renaming);
                    return Ok(());
                }
            }
        }

        // 3. Present on this host as a file
        if let Some(source_renaming) = &param.source_renaming {
            let path = self.absolute(Path::new(source_renaming));
            if path.exists() {
                let target = self.absolute(Path::new(&final_renaming));
                if param.preserve_source {
                    std::fs::copy(&path, &target)
                        .map_err(|e| Error::Transfer(format!("copying binding object: {e}")))?;
                } else {
                    self.move_file(&path, &target)
                        .map_err(|e| Error::Transfer(format!("moving binding object: {e}")))?;
                }
                self.binding_cache
                    .lock()
                    .expect("binding cache lock")
                    .insert(final_renaming.clone());
                let register = self.registry.get_or_create(&final_renaming);
                register
                    .lock()
                    .expect("register lock")
                    .add_file_location(target);
                return Ok(());
            }
        }

        // 4. All local options exhausted: transfer
        let fetched = self.transfer(param, None).await?;
        if let FetchedValue::File(path) = fetched {
            let register = self.registry.get_or_create(&final_renaming);
            register
                .lock()
                .expect("register lock")
                .add_file_location(path);
        }
        self.binding_cache
            .lock()
            .expect("binding cache lock")
            .insert(final_renaming);
        Ok(())
    }

    /// Open the manifest, fetch every element through a composite listener
    /// and record one `<type-ordinal> <value>` line per element. The
    /// collection completes when all children complete.
    fn fetch_collection(
        self: &Arc<Self>,
        param: &JobParam,
        index: usize,
        listener: Arc<dyn FetchDataListener>,
    ) {
        let renaming = Self::local_renaming(param);
        let JobPayload::File(path) = &param.payload else {
            listener.error_fetching_value(
                &renaming,
                Error::Internal("collection parameter without manifest path".into()),
            );
            return;
        };
        let manifest = self.absolute(path);
        info!(
            index,
            renaming,
            elements = param.elements.len(),
            "Fetching collection"
        );

        let result = (|| -> Result<()> {
            if let Some(parent) = manifest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Internal(format!("creating {}: {e}", parent.display())))?;
            }
            let mut writer = std::fs::File::create(&manifest)
                .map_err(|e| Error::Internal(format!("creating {}: {e}", manifest.display())))?;

            let composite = Arc::new(MultiOperationFetchListener::new(
                renaming.clone(),
                listener.clone(),
            ));
            for (sub_index, element) in param.elements.iter().enumerate() {
                composite.add_operation();
                self.fetch_param(element, sub_index, composite.clone());
                writeln!(
                    writer,
                    "{} {}",
                    element.param_type.ordinal(),
                    Self::manifest_value(element)
                )
                .map_err(|e| Error::Internal(format!("writing manifest: {e}")))?;
            }
            composite.enable();
            Ok(())
        })();

        if let Err(error) = result {
            listener.error_fetching_value(&renaming, error);
        }
    }

    fn manifest_value(param: &JobParam) -> String {
        match &param.payload {
            JobPayload::File(path) => path.display().to_string(),
            JobPayload::Id(id) => id.clone(),
            JobPayload::Primitive(value) => value.to_string(),
            JobPayload::Object(_) | JobPayload::None => Self::local_renaming(param),
        }
    }

    async fn transfer(&self, param: &JobParam, target: Option<PathBuf>) -> Result<FetchedValue> {
        let renaming = param
            .source_renaming
            .clone()
            .unwrap_or_else(|| Self::local_renaming(param));
        let _permit = self
            .transfer_slots
            .acquire()
            .await
            .map_err(|_| Error::Internal("transfer pool closed".into()))?;
        let fetched = self
            .provider
            .ask_for_transfer(TransferRequest {
                renaming,
                kind: param.param_type,
                sources: param.sources.clone(),
                target_path: target,
            })
            .await?;
        self.transferred_bytes
            .fetch_add(fetched.size_bytes(), Ordering::Relaxed);
        Ok(fetched)
    }

    // ------------------------------------------------------------------
    // Load / store
    // ------------------------------------------------------------------

    /// Final cache lookup just before execution, after any pending transfer.
    pub async fn load_param(&self, param: &JobParam) -> Result<LoadedValue> {
        let renaming = Self::local_renaming(param);
        match param.param_type {
            ParamType::Object => {
                let register = self
                    .registry
                    .get(&renaming)
                    .ok_or_else(|| Error::NoSources(renaming.clone()))?;
                let bytes = register
                    .lock()
                    .expect("register lock")
                    .load_value(&renaming)?;
                Ok(LoadedValue::Bytes(bytes))
            }
            ParamType::Psco => {
                let psco_id = match &param.payload {
                    JobPayload::Id(id) => id.clone(),
                    _ => return Err(Error::Internal("psco parameter without id".into())),
                };
                match &self.storage {
                    Some(storage) => {
                        let bytes = storage.get_by_id(&psco_id).await?;
                        Ok(LoadedValue::Bytes(bytes))
                    }
                    None => Ok(LoadedValue::Id(psco_id)),
                }
            }
            ParamType::File | ParamType::Collection => match &param.payload {
                JobPayload::File(path) => Ok(LoadedValue::Path(self.absolute(path))),
                _ => Err(Error::Internal("file parameter without path".into())),
            },
            ParamType::ExternalPsco | ParamType::BindingObject | ParamType::Stream => {
                match &param.payload {
                    JobPayload::Id(id) => Ok(LoadedValue::Id(id.clone())),
                    _ => Ok(LoadedValue::Id(renaming)),
                }
            }
            _ => match &param.payload {
                JobPayload::Primitive(value) => Ok(LoadedValue::Primitive(value.clone())),
                _ => Ok(LoadedValue::None),
            },
        }
    }

    /// Publish a produced in-memory value.
    pub fn store_value(&self, renaming: &str, value: Vec<u8>) {
        let register = self.registry.get_or_create(renaming);
        register.lock().expect("register lock").set_value(value);
    }

    /// Publish a produced file.
    pub fn store_file(&self, renaming: &str, path: impl Into<PathBuf>) {
        let register = self.registry.get_or_create(renaming);
        register
            .lock()
            .expect("register lock")
            .add_file_location(path.into());
    }

    /// Publish a produced binding-object handle.
    pub fn store_binding(&self, name: &str) {
        self.binding_cache
            .lock()
            .expect("binding cache lock")
            .insert(name.to_string());
    }

    /// Synchronous-style lookup: loads from disk or storage if needed.
    pub async fn get_object(&self, renaming: &str) -> Result<Vec<u8>> {
        if let Some(register) = self.registry.get(renaming) {
            let (cached, storage_id) = {
                let mut guard = register.lock().expect("register lock");
                match guard.load_value(renaming) {
                    Ok(bytes) => (Some(bytes), None),
                    Err(_) => (None, guard.storage_id().map(str::to_string)),
                }
            };
            if let Some(bytes) = cached {
                return Ok(bytes);
            }
            if let (Some(id), Some(storage)) = (storage_id, &self.storage) {
                return storage.get_by_id(&id).await;
            }
        }
        Err(Error::NoSources(renaming.to_string()))
    }

    /// Evict obsolete renamings: delete backing files and clear registers.
    /// Re-removing an already-evicted renaming is a no-op.
    pub fn remove_obsoletes(&self, renamings: &[String]) {
        for renaming in renamings {
            let path = self.absolute(Path::new(renaming));
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(renaming, path = %path.display(), error = %e, "Failed to remove file");
                }
            }
            self.registry.remove(renaming);
            self.binding_cache
                .lock()
                .expect("binding cache lock")
                .remove(renaming);
            debug!(renaming, "Removed from cache");
        }
    }

    pub fn is_local(&self, renaming: &str) -> bool {
        self.registry
            .get(renaming)
            .map(|r| r.lock().expect("register lock").is_local())
            .unwrap_or(false)
    }
}
