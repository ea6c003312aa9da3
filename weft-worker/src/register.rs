//! Data registers: where a renaming physically lives on this worker
//!
//! A register is *local* when it holds an in-memory value, at least one file
//! location or a storage id. The registry map is guarded by a coarse lock
//! held only for lookup and insert; each register has its own lock for
//! value and file-list mutation. Two registers are never locked at once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use weft_core::{Error, Result};

/// Physical sources of one renaming.
#[derive(Debug, Default)]
pub struct DataRegister {
    value: Option<Vec<u8>>,
    files: Vec<PathBuf>,
    storage_id: Option<String>,
}

impl DataRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local iff any source is populated.
    pub fn is_local(&self) -> bool {
        self.value.is_some() || !self.files.is_empty() || self.storage_id.is_some()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn set_value(&mut self, value: Vec<u8>) {
        self.value = Some(value);
    }

    pub fn remove_value(&mut self) -> Option<Vec<u8>> {
        self.value.take()
    }

    pub fn file_locations(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn add_file_location(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.files.contains(&path) {
            self.files.push(path);
        }
    }

    pub fn remove_file_location(&mut self, path: &Path) {
        self.files.retain(|p| p != path);
    }

    pub fn storage_id(&self) -> Option<&str> {
        self.storage_id.as_deref()
    }

    pub fn set_storage_id(&mut self, id: impl Into<String>) {
        self.storage_id = Some(id.into());
    }

    /// Release every source.
    pub fn clear(&mut self) {
        self.value = None;
        self.files.clear();
        self.storage_id = None;
    }

    /// Hydrate the in-memory value from whichever source is available:
    /// cached value first, then any readable file. Storage-backed values are
    /// hydrated by the data manager before it reaches for the register.
    pub fn load_value(&mut self, renaming: &str) -> Result<Vec<u8>> {
        if let Some(value) = &self.value {
            return Ok(value.clone());
        }
        for path in &self.files {
            match std::fs::read(path) {
                Ok(bytes) => {
                    self.value = Some(bytes.clone());
                    return Ok(bytes);
                }
                Err(e) => {
                    tracing::warn!(renaming, path = %path.display(), error = %e, "Unreadable file source");
                }
            }
        }
        Err(Error::NoSources(renaming.to_string()))
    }

    /// Copy of the value for preserve-source fetches.
    pub fn clone_value(&mut self, renaming: &str) -> Result<Vec<u8>> {
        self.load_value(renaming)
    }

    /// Consume the value for non-preserving fetches.
    pub fn take_value(&mut self, renaming: &str) -> Result<Vec<u8>> {
        let value = self.load_value(renaming)?;
        self.value = None;
        Ok(value)
    }
}

/// Registry of registers keyed by renaming.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<HashMap<String, Arc<Mutex<DataRegister>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, renaming: &str) -> Option<Arc<Mutex<DataRegister>>> {
        self.inner.lock().expect("registry lock").get(renaming).cloned()
    }

    pub fn get_or_create(&self, renaming: &str) -> Arc<Mutex<DataRegister>> {
        self.inner
            .lock()
            .expect("registry lock")
            .entry(renaming.to_string())
            .or_default()
            .clone()
    }

    /// Remove the register and clear its sources. Idempotent.
    pub fn remove(&self, renaming: &str) {
        let register = self.inner.lock().expect("registry lock").remove(renaming);
        if let Some(register) = register {
            register.lock().expect("register lock").clear();
        }
    }

    pub fn contains(&self, renaming: &str) -> bool {
        self.inner.lock().expect("registry lock").contains_key(renaming)
    }
}
