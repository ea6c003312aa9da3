//! Persistent-storage collaborator
//!
//! Backend for PSCO parameters whose id is the value. The backend is
//! pluggable; a worker without storage configuration runs with PSCO support
//! silently disabled.

use async_trait::async_trait;
use std::path::Path;
use weft_core::Result;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Bring the backend up from its configuration file.
    async fn init(&self, config: &Path) -> Result<()>;

    /// Release backend resources.
    async fn finish(&self) -> Result<()>;

    /// Materialize the object bytes for an id.
    async fn get_by_id(&self, psco_id: &str) -> Result<Vec<u8>>;

    /// Request a replica of the object on the given host.
    async fn new_replica(&self, psco_id: &str, host: &str) -> Result<()>;

    /// Create a new version of the object, returning its id.
    async fn new_version(&self, psco_id: &str) -> Result<String>;
}
