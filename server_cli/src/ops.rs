//! Composition of the extension DDL actions over the subscription
//! supervisor and the object-storage collaborator.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use common::err::SResult;
use replication::supervisor::SubscriptionSupervisor;
use translate::intercept::{BackupRequest, CreateSubscriptionRequest, ExtensionOps};

use crate::objectstore::{ObjectStore, StoreLocation};

pub struct FrontOps {
    pub supervisor: Arc<SubscriptionSupervisor>,
    pub object_store: Arc<dyn ObjectStore>,
    pub db_path: PathBuf,
}

impl ExtensionOps for FrontOps {
    fn create_subscription(&self, request: &CreateSubscriptionRequest) -> SResult<()> {
        info!(
            "creating subscription '{}' (publication '{}')",
            request.name, request.publication
        );
        self.supervisor.create(request)
    }

    fn backup(&self, request: &BackupRequest) -> SResult<()> {
        let location = StoreLocation {
            uri: request.uri.clone(),
            endpoint: request.endpoint.clone(),
            access_key_id: request.access_key_id.clone(),
            secret_access_key: request.secret_access_key.clone(),
        };
        self.object_store.put(&location, &self.db_path)
    }

    fn wal_position(&self) -> u64 {
        self.supervisor.max_progress().0
    }
}
