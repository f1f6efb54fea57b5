//! Single owner of the subscription worker set. External callers send
//! management calls here instead of touching any shared map; each worker is
//! driven only by its own thread afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use common::err::server_error::ServerError;
use common::err::SResult;
use engine::iface::EngineConn;
use engine::pool::ConnectionPool;
use translate::intercept::CreateSubscriptionRequest;

use crate::consumer::Replicator;
use crate::lsn::Lsn;
use crate::store::{self, SubscriptionRow};

/// Engine connection ids reserved for replication workers, clear of the
/// client connection id range.
const REPL_CONN_ID_BASE: u32 = 0xF000_0000;

struct WorkerHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    progress: Arc<Mutex<Lsn>>,
}

pub struct SubscriptionSupervisor {
    pool: Arc<ConnectionPool>,
    /// Dedicated engine connection for management reads and writes.
    mgmt: Mutex<Box<dyn EngineConn>>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    next_conn_id: AtomicU32,
}

impl SubscriptionSupervisor {
    pub fn new(pool: Arc<ConnectionPool>, mgmt: Box<dyn EngineConn>) -> Self {
        SubscriptionSupervisor {
            pool,
            mgmt: Mutex::new(mgmt),
            workers: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU32::new(REPL_CONN_ID_BASE),
        }
    }

    /// Load persisted subscriptions and start the enabled ones.
    pub fn start_saved(&self) -> SResult<usize> {
        let rows = {
            let mut mgmt = self.mgmt.lock().unwrap();
            store::load_subscriptions(mgmt.as_mut())?
        };
        let mut started = 0;
        for row in rows {
            if row.enabled {
                self.spawn(row)?;
                started += 1;
            }
        }
        Ok(started)
    }

    /// CREATE SUBSCRIPTION: persist, then start streaming.
    pub fn create(&self, request: &CreateSubscriptionRequest) -> SResult<()> {
        {
            let workers = self.workers.lock().unwrap();
            if workers.contains_key(&request.name) {
                return Err(ServerError::sql(
                    "42710",
                    format!("subscription \"{}\" already exists", request.name),
                ));
            }
        }
        let row = SubscriptionRow {
            name: request.name.clone(),
            connection_string: request.connection_string.clone(),
            publication: request.publication.clone(),
            last_commit_lsn: Lsn::ZERO,
            enabled: true,
        };
        {
            let mut mgmt = self.mgmt.lock().unwrap();
            store::upsert_subscription(mgmt.as_mut(), &row)?;
        }
        self.spawn(row)
    }

    pub fn enable(&self, name: &str) -> SResult<()> {
        {
            let mut mgmt = self.mgmt.lock().unwrap();
            store::set_enabled(mgmt.as_mut(), name, true)?;
        }
        let rows = {
            let mut mgmt = self.mgmt.lock().unwrap();
            store::load_subscriptions(mgmt.as_mut())?
        };
        match rows.into_iter().find(|r| r.name == name) {
            Some(row) => self.spawn(row),
            None => Err(ServerError::sql(
                "42704",
                format!("subscription \"{}\" does not exist", name),
            )),
        }
    }

    pub fn disable(&self, name: &str) -> SResult<()> {
        self.stop_worker(name);
        let mut mgmt = self.mgmt.lock().unwrap();
        store::set_enabled(mgmt.as_mut(), name, false)
    }

    /// DROP SUBSCRIPTION: stop the worker and delete the row.
    pub fn remove(&self, name: &str) -> SResult<()> {
        self.stop_worker(name);
        let mut mgmt = self.mgmt.lock().unwrap();
        mgmt.execute(&format!(
            "DELETE FROM {}.subscriptions WHERE name = {}",
            store::RESERVED_SCHEMA,
            engine::value::quote_literal(name),
        ))?;
        Ok(())
    }

    /// Durable progress of a running worker, if any.
    pub fn progress(&self, name: &str) -> Option<Lsn> {
        let workers = self.workers.lock().unwrap();
        workers.get(name).map(|w| *w.progress.lock().unwrap())
    }

    /// Highest durable progress across every running worker, for the WAL
    /// position probes.
    pub fn max_progress(&self) -> Lsn {
        let workers = self.workers.lock().unwrap();
        workers
            .values()
            .map(|w| *w.progress.lock().unwrap())
            .max()
            .unwrap_or(Lsn::ZERO)
    }

    pub fn running(&self) -> Vec<String> {
        let workers = self.workers.lock().unwrap();
        let mut names: Vec<String> = workers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn shutdown(&self) {
        let names = self.running();
        for name in names {
            self.stop_worker(&name);
        }
    }

    fn stop_worker(&self, name: &str) {
        let handle = {
            let mut workers = self.workers.lock().unwrap();
            workers.remove(name)
        };
        if let Some(mut handle) = handle {
            handle.stop.store(true, Ordering::Release);
            if let Some(join) = handle.join.take() {
                if join.join().is_err() {
                    warn!("subscription '{}' worker panicked", name);
                }
            }
            info!("subscription '{}' worker stopped", name);
        }
    }

    fn spawn(&self, row: SubscriptionRow) -> SResult<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(Mutex::new(row.last_commit_lsn));
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = row.name.clone();

        let pool = self.pool.clone();
        let thread_stop = stop.clone();
        let thread_progress = progress.clone();
        let join = std::thread::Builder::new()
            .name(format!("repl-{}", name))
            .spawn(move || {
                match Replicator::new(row, pool, conn_id, thread_stop, thread_progress) {
                    Ok(mut replicator) => replicator.run(),
                    Err(err) => error!("replicator failed to start: {}", err),
                }
            })
            .map_err(|err| ServerError::String(format!("spawn worker: {}", err)))?;

        let mut workers = self.workers.lock().unwrap();
        workers.insert(
            name.clone(),
            WorkerHandle {
                stop,
                join: Some(join),
                progress,
            },
        );
        info!("subscription '{}' worker started", name);
        Ok(())
    }
}

impl Drop for SubscriptionSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
