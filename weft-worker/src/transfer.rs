//! Fetch listeners and the transfer-provider seam
//!
//! Fetches report through [`FetchDataListener`] callbacks so that duplicate
//! requests for the same renaming can attach to an in-flight operation.
//! Collections compose a [`MultiOperationFetchListener`] over their
//! children; the executor awaits a [`WaitListener`].

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use weft_core::{Error, ParamType, Result};
use weft_runtime::DataSource;

/// Completion callback for one fetch operation.
pub trait FetchDataListener: Send + Sync {
    fn fetched_value(&self, renaming: &str);
    fn error_fetching_value(&self, renaming: &str, error: Error);
}

/// Composite listener over a group of fetch operations: completes when all
/// registered operations complete, fails on the first failure.
pub struct MultiOperationFetchListener {
    group_id: String,
    inner: Arc<dyn FetchDataListener>,
    pending: AtomicUsize,
    /// Operations may still be registered until enabled
    enabled: AtomicBool,
    failed: AtomicBool,
}

impl MultiOperationFetchListener {
    pub fn new(group_id: impl Into<String>, inner: Arc<dyn FetchDataListener>) -> Self {
        Self {
            group_id: group_id.into(),
            inner,
            pending: AtomicUsize::new(0),
            enabled: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    /// Register one more operation. Must happen before `enable`.
    pub fn add_operation(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// All operations registered; the group completes once pending drains.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        self.maybe_complete();
    }

    fn maybe_complete(&self) {
        if self.enabled.load(Ordering::SeqCst)
            && self.pending.load(Ordering::SeqCst) == 0
            && !self.failed.load(Ordering::SeqCst)
        {
            self.inner.fetched_value(&self.group_id);
        }
    }
}

impl FetchDataListener for MultiOperationFetchListener {
    fn fetched_value(&self, _renaming: &str) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.maybe_complete();
    }

    fn error_fetching_value(&self, renaming: &str, error: Error) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            self.inner.error_fetching_value(
                &self.group_id,
                Error::Transfer(format!("fetching {renaming}: {error}")),
            );
        }
    }
}

/// Listener backed by a oneshot channel, for await-style callers.
pub struct WaitListener {
    tx: Mutex<Option<oneshot::Sender<Result<String>>>>,
}

impl WaitListener {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<Result<String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

impl FetchDataListener for WaitListener {
    fn fetched_value(&self, renaming: &str) {
        if let Some(tx) = self.tx.lock().expect("wait listener lock").take() {
            let _ = tx.send(Ok(renaming.to_string()));
        }
    }

    fn error_fetching_value(&self, _renaming: &str, error: Error) {
        if let Some(tx) = self.tx.lock().expect("wait listener lock").take() {
            let _ = tx.send(Err(error));
        }
    }
}

/// A transfer to pull one renaming onto this worker.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub renaming: String,
    pub kind: ParamType,
    pub sources: Vec<DataSource>,
    /// Target path for file-like transfers
    pub target_path: Option<PathBuf>,
}

/// Value delivered by a transfer.
#[derive(Debug, Clone)]
pub enum FetchedValue {
    /// Written at the requested target path
    File(PathBuf),
    Bytes(Vec<u8>),
    StorageId(String),
}

impl FetchedValue {
    pub fn size_bytes(&self) -> u64 {
        match self {
            FetchedValue::File(path) => std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            FetchedValue::Bytes(bytes) => bytes.len() as u64,
            FetchedValue::StorageId(_) => 0,
        }
    }
}

/// The worker's data-provider collaborator: pulls renamings from remote
/// sources. Transports are external; the data manager only knows this seam.
#[async_trait]
pub trait DataProvider: Send + Sync {
    async fn ask_for_transfer(&self, request: TransferRequest) -> Result<FetchedValue>;

    /// Whether a persistent in-process binding cache is available.
    fn is_persistent_enabled(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        fetched: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fetched: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
            })
        }
    }

    impl FetchDataListener for Recorder {
        fn fetched_value(&self, renaming: &str) {
            self.fetched.lock().unwrap().push(renaming.to_string());
        }

        fn error_fetching_value(&self, renaming: &str, _error: Error) {
            self.errors.lock().unwrap().push(renaming.to_string());
        }
    }

    #[test]
    fn test_multi_listener_completes_after_enable() {
        let recorder = Recorder::new();
        let multi = MultiOperationFetchListener::new("group", recorder.clone());
        multi.add_operation();
        multi.add_operation();

        multi.fetched_value("a");
        multi.fetched_value("b");
        // Not yet enabled
        assert!(recorder.fetched.lock().unwrap().is_empty());

        multi.enable();
        assert_eq!(recorder.fetched.lock().unwrap().as_slice(), ["group"]);
    }

    #[test]
    fn test_multi_listener_waits_for_all_children() {
        let recorder = Recorder::new();
        let multi = MultiOperationFetchListener::new("group", recorder.clone());
        multi.add_operation();
        multi.add_operation();
        multi.enable();

        multi.fetched_value("a");
        assert!(recorder.fetched.lock().unwrap().is_empty());
        multi.fetched_value("b");
        assert_eq!(recorder.fetched.lock().unwrap().as_slice(), ["group"]);
    }

    #[test]
    fn test_multi_listener_fails_once() {
        let recorder = Recorder::new();
        let multi = MultiOperationFetchListener::new("group", recorder.clone());
        multi.add_operation();
        multi.add_operation();
        multi.enable();

        multi.error_fetching_value("a", Error::Transfer("boom".into()));
        multi.error_fetching_value("b", Error::Transfer("boom".into()));
        assert_eq!(recorder.errors.lock().unwrap().as_slice(), ["group"]);
        assert!(recorder.fetched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_listener_resolves() {
        let (listener, rx) = WaitListener::new();
        listener.fetched_value("d1_v1");
        assert_eq!(rx.await.unwrap().unwrap(), "d1_v1");
    }

    #[tokio::test]
    async fn test_wait_listener_propagates_error() {
        let (listener, rx) = WaitListener::new();
        listener.error_fetching_value("d1_v1", Error::Transfer("link down".into()));
        assert!(rx.await.unwrap().is_err());
    }
}
