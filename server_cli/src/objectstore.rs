//! Interface to the object-storage collaborator used by BACKUP/restore.
//! The SDK itself is external; builds wire a real implementation in here.

use std::path::Path;

use tracing::info;

use common::err::server_error::ServerError;
use common::err::SResult;

#[derive(Debug, Clone)]
pub struct StoreLocation {
    pub uri: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

pub trait ObjectStore: Send + Sync {
    /// Upload a local file to the given location.
    fn put(&self, location: &StoreLocation, file: &Path) -> SResult<()>;

    /// Download a remote object into the given path.
    fn get(&self, location: &StoreLocation, dest: &Path) -> SResult<()>;
}

/// Stand-in used when no SDK is linked: uploads are logged and refused,
/// restores fail so startup aborts instead of opening a missing database.
#[derive(Debug, Default)]
pub struct UnconfiguredStore;

impl ObjectStore for UnconfiguredStore {
    fn put(&self, location: &StoreLocation, file: &Path) -> SResult<()> {
        info!(
            "backup of {:?} to {} requested, no object store linked",
            file, location.uri
        );
        Err(ServerError::Unsupported(
            "no object storage backend configured".to_string(),
        ))
    }

    fn get(&self, location: &StoreLocation, _dest: &Path) -> SResult<()> {
        Err(ServerError::Config(format!(
            "cannot restore from {}: no object storage backend configured",
            location.uri
        )))
    }
}
