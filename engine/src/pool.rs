use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use common::err::SResult;

use crate::iface::{EngineConn, EngineConnector};

/// Engine connection pinned to one client connection ID. The guard type is
/// async because wire sessions hold it across socket writes.
pub type PinnedConn = Arc<Mutex<Box<dyn EngineConn>>>;

/// Not a round-robin pool: the engine exposes transactions as connection
/// state, so a session must land on the same underlying handle for its whole
/// lifetime. This is a connection-id -> handle map with creation on first
/// use.
pub struct ConnectionPool {
    connector: RwLock<Arc<dyn EngineConnector>>,
    conns: DashMap<u32, PinnedConn>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn EngineConnector>) -> Self {
        ConnectionPool {
            connector: RwLock::new(connector),
            conns: DashMap::new(),
        }
    }

    /// Returns the connection pinned to `conn_id`, creating it lazily.
    /// Repeated acquisition with the same ID returns the same handle until
    /// `release`.
    pub fn acquire(&self, conn_id: u32, database: &str) -> SResult<PinnedConn> {
        if let Some(existing) = self.conns.get(&conn_id) {
            return Ok(existing.clone());
        }

        let connector = self.connector.read().unwrap().clone();
        let conn = connector.connect(database)?;
        debug!("engine connection created for client {}", conn_id);

        let pinned: PinnedConn = Arc::new(Mutex::new(conn));
        self.conns.insert(conn_id, pinned.clone());
        Ok(pinned)
    }

    /// Drop the pinned connection on client disconnect. An in-progress
    /// statement still holds a reference; the handle then closes when that
    /// statement finishes and the last clone drops. A close failure is
    /// logged but does not fail the disconnect.
    pub fn release(&self, conn_id: u32) {
        if let Some((_, pinned)) = self.conns.remove(&conn_id) {
            Self::close_now_or_defer(conn_id, pinned);
        }
    }

    /// Discard every pinned connection and install a fresh connector after a
    /// catalog swap (restore).
    pub fn reset_and_start(&self, connector: Arc<dyn EngineConnector>) {
        let ids: Vec<u32> = self.conns.iter().map(|e| *e.key()).collect();
        for conn_id in ids {
            if let Some((_, pinned)) = self.conns.remove(&conn_id) {
                Self::close_now_or_defer(conn_id, pinned);
            }
        }
        *self.connector.write().unwrap() = connector;
    }

    fn close_now_or_defer(conn_id: u32, pinned: PinnedConn) {
        match Arc::try_unwrap(pinned) {
            Ok(mutex) => {
                let mut conn = mutex.into_inner();
                if let Err(err) = conn.close() {
                    warn!("closing engine connection {} failed: {}", conn_id, err);
                }
            }
            Err(_) => {
                debug!(
                    "engine connection {} still in use, closing when released",
                    conn_id
                );
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.conns.len()
    }
}
