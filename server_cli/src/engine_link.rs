//! Integration point for the embedded analytical engine. The engine is an
//! external collaborator behind `engine::iface::EngineConnector`; a
//! production build links its driver here. The workspace ships with the
//! in-memory stand-in so the wire surfaces and replication plumbing run
//! end to end without it.

use std::path::Path;
use std::sync::Arc;

use common::err::server_error::ServerError;
use common::err::SResult;
use engine::iface::EngineConnector;
use engine::mock::MockConnector;

pub fn open_engine(db_path: &Path) -> SResult<Arc<dyn EngineConnector>> {
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir).map_err(|err| {
            ServerError::Config(format!("cannot create data directory {:?}: {}", dir, err))
        })?;
    }
    // opening the database file is one of the fatal startup steps
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(db_path)
        .map_err(|err| {
            ServerError::Config(format!("cannot open database file {:?}: {}", db_path, err))
        })?;

    Ok(Arc::new(MockConnector::new()))
}
