//! Streaming consumer for one subscription: receives logical messages,
//! feeds the delta buffer, and merges it into the engine under strict
//! transactional boundaries with crash-safe LSN bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use common::err::server_error::ServerError;
use common::err::SResult;
use engine::iface::EngineConn;
use engine::pool::{ConnectionPool, PinnedConn};

use crate::client::{PrimaryConfig, ReplicaClient};
use crate::delta::{Delta, TxnInfo, ACTION_DELETE, ACTION_INSERT};
use crate::lsn::Lsn;
use crate::pgoutput::{LogicalMessage, ReplicationFrame, TupleData};
use crate::relation::RelationDescriptor;
use crate::state::{FlushReason, ReplicationState};
use crate::store::{self, SubscriptionRow};

pub const STANDBY_INTERVAL: Duration = Duration::from_secs(10);
pub const FLUSH_TICK: Duration = Duration::from_millis(200);
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;
pub const SLOT_BUSY_BACKOFF: Duration = Duration::from_millis(100);
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// One replication worker. Owned and driven by a dedicated thread; the
/// supervisor holds only the stop flag and the shared progress cell.
pub struct Replicator {
    sub: SubscriptionRow,
    primary: PrimaryConfig,
    pool: Arc<ConnectionPool>,
    conn_id: u32,
    stop: Arc<AtomicBool>,
    progress: Arc<Mutex<Lsn>>,

    state: ReplicationState,
    delta: Delta,
    relations: HashMap<u32, RelationDescriptor>,
    pinned: Option<PinnedConn>,
    standby_requested: bool,
    /// Whether the current connection received any frame; resets the
    /// consecutive-failure counter.
    streamed_any: bool,
}

impl Replicator {
    pub fn new(
        sub: SubscriptionRow,
        pool: Arc<ConnectionPool>,
        conn_id: u32,
        stop: Arc<AtomicBool>,
        progress: Arc<Mutex<Lsn>>,
    ) -> SResult<Self> {
        let primary = PrimaryConfig::parse(&sub.connection_string)?;
        Ok(Replicator {
            sub,
            primary,
            pool,
            conn_id,
            stop,
            progress,
            state: ReplicationState::new(Lsn::ZERO),
            delta: Delta::new(),
            relations: HashMap::new(),
            pinned: None,
            standby_requested: false,
            streamed_any: false,
        })
    }

    fn with_engine<T>(&self, f: impl FnOnce(&mut dyn EngineConn) -> SResult<T>) -> SResult<T> {
        let pinned = self
            .pinned
            .as_ref()
            .ok_or_else(|| ServerError::Replication("engine connection not acquired".to_string()))?;
        let mut guard = pinned.blocking_lock();
        f(guard.as_mut())
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Thread body: stream with reconnection. Transient errors retry with
    /// backoff up to the consecutive-failure limit; anything else is fatal
    /// and disables the subscription.
    pub fn run(&mut self) {
        let mut failures = 0u32;
        loop {
            if self.stopped() {
                return;
            }
            match self.connect_and_stream() {
                Ok(()) => return,
                Err(err) if err.is_transient() && failures + 1 < MAX_CONSECUTIVE_FAILURES => {
                    if self.streamed_any {
                        // the stream made progress before breaking; only
                        // back-to-back failures count toward the limit
                        failures = 0;
                        self.streamed_any = false;
                    }
                    failures += 1;
                    let backoff = if err.to_string().contains("is active") {
                        // replication slot still held by a dying peer
                        SLOT_BUSY_BACKOFF
                    } else {
                        RECONNECT_BACKOFF
                    };
                    warn!(
                        "subscription '{}' stream error ({}), retry {}/{} in {:?}",
                        self.sub.name, err, failures, MAX_CONSECUTIVE_FAILURES, backoff
                    );
                    std::thread::sleep(backoff);
                }
                Err(err) => {
                    error!(
                        "subscription '{}' failed permanently: {}",
                        self.sub.name, err
                    );
                    if let Err(disable_err) =
                        self.with_engine(|conn| store::set_enabled(conn, &self.sub.name, false))
                    {
                        error!(
                            "could not disable subscription '{}': {}",
                            self.sub.name, disable_err
                        );
                    }
                    return;
                }
            }
        }
    }

    /// One streaming session: ensure primary-side objects, resume from the
    /// durable LSN, then pump messages until stop or error.
    fn connect_and_stream(&mut self) -> SResult<()> {
        let pinned = self.pool.acquire(self.conn_id, &self.primary.dbname)?;
        self.pinned = Some(pinned);

        // primary-side bookkeeping on a regular connection
        let mut sql = ReplicaClient::connect_sql(&self.primary)?;
        sql.ensure_publication(&self.sub.publication)?;
        sql.ensure_slot(&self.sub.name)?;
        sql.shutdown();

        let durable = self.with_engine(|conn| store::read_progress(conn, &self.sub.name))?;
        self.state = ReplicationState::new(durable);
        self.delta.clear();
        self.standby_requested = false;
        info!(
            "subscription '{}' streaming from {}",
            self.sub.name,
            durable.next()
        );

        let mut stream = ReplicaClient::connect_replication(&self.primary)?;
        stream.start_replication(&self.sub.name, &self.sub.publication, durable.next())?;

        let mut next_standby = Instant::now() + STANDBY_INTERVAL;
        let mut next_tick = Instant::now() + FLUSH_TICK;

        let result = loop {
            if self.stopped() {
                break self.graceful_stop();
            }

            let now = Instant::now();
            if now >= next_standby || self.standby_requested {
                self.standby_requested = false;
                stream.send_standby_update(
                    self.state.last_received_lsn.next(),
                    self.state.last_written_lsn.next(),
                    self.state.last_written_lsn.next(),
                    false,
                )?;
                next_standby = now + STANDBY_INTERVAL;
            }
            if now >= next_tick {
                if self.delta.is_dirty() && !self.state.dirty_txn {
                    if let Err(err) = self.flush(FlushReason::TimeTick) {
                        break Err(err);
                    }
                }
                next_tick = now + FLUSH_TICK;
            }

            let deadline = next_standby.min(next_tick);
            let timeout = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(10));
            stream.set_read_timeout(timeout)?;

            match stream.recv_replication() {
                Ok(None) => continue,
                Ok(Some(frame)) => {
                    if let Err(err) = self.handle_frame(frame) {
                        break Err(err);
                    }
                }
                Err(err) => break Err(err),
            }
        };

        stream.shutdown();
        if result.is_err() {
            self.abandon_batch();
        }
        result
    }

    /// Stop requested: flush only a clean buffer, roll back anything else.
    fn graceful_stop(&mut self) -> SResult<()> {
        if self.delta.is_dirty() && !self.state.dirty_txn {
            if let Err(err) = self.flush(FlushReason::Shutdown) {
                warn!("flush on stop failed: {}", err);
                self.abandon_batch();
            }
        } else {
            self.abandon_batch();
        }
        info!("subscription '{}' stopped", self.sub.name);
        Ok(())
    }

    /// Roll back the open engine transaction and drop buffered rows; the
    /// primary will resend everything past the durable LSN.
    fn abandon_batch(&mut self) {
        self.delta.clear();
        if self.state.ongoing_batch_txn {
            if let Err(err) = self.with_engine(|conn| conn.rollback()) {
                warn!("rollback failed: {}", err);
            }
            self.state.ongoing_batch_txn = false;
        }
        self.state.dirty_txn = false;
        self.state.dirty_stream = false;
        self.state.in_txn_stmt_id = 0;
    }

    pub fn handle_frame(&mut self, frame: ReplicationFrame) -> SResult<()> {
        match frame {
            ReplicationFrame::Keepalive {
                wal_end,
                reply_requested,
                ..
            } => {
                self.state.last_received_lsn = self.state.last_received_lsn.max(wal_end);
                if reply_requested {
                    self.standby_requested = true;
                }
                Ok(())
            }
            ReplicationFrame::XLogData { wal_end, data, .. } => {
                self.streamed_any = true;
                self.state.last_received_lsn = self.state.last_received_lsn.max(wal_end);
                let message = crate::pgoutput::parse_logical(&data, self.state.in_stream)?;
                self.handle_logical(message)
            }
        }
    }

    pub fn handle_logical(&mut self, message: LogicalMessage) -> SResult<()> {
        match message {
            LogicalMessage::Relation {
                rel_id,
                namespace,
                name,
                columns,
                ..
            } => {
                let rel = RelationDescriptor::from_message(rel_id, &namespace, &name, &columns)?;
                if self.relations.contains_key(&rel_id) {
                    // schema change boundary
                    if self.delta.is_dirty() {
                        self.flush(FlushReason::Ddl)?;
                    }
                }
                self.with_engine(|conn| {
                    conn.execute(&rel.create_schema_sql())?;
                    conn.execute(&rel.create_table_sql())?;
                    Ok(())
                })?;
                self.relations.insert(rel_id, rel);
                Ok(())
            }

            LogicalMessage::Begin { final_lsn, .. } => {
                if final_lsn <= self.state.last_written_lsn {
                    // already durable; replay from a primary resend
                    self.state.process_messages = false;
                    return Ok(());
                }
                self.state.process_messages = true;
                self.state.current_txn_lsn = final_lsn;
                self.state.dirty_txn = true;
                if !self.state.ongoing_batch_txn {
                    self.with_engine(|conn| conn.begin())?;
                    self.state.ongoing_batch_txn = true;
                }
                Ok(())
            }

            LogicalMessage::Insert { rel_id, new } => {
                if !self.state.process_messages {
                    return Ok(());
                }
                self.append_insert(rel_id, &new)?;
                self.state.in_txn_stmt_id += 1;
                self.state.dirty_stream = true;
                Ok(())
            }

            LogicalMessage::Update {
                rel_id,
                key,
                old,
                new,
            } => {
                if !self.state.process_messages {
                    return Ok(());
                }
                self.append_update(rel_id, key.as_deref(), old.as_deref(), &new)?;
                self.state.in_txn_stmt_id += 1;
                self.state.dirty_stream = true;
                Ok(())
            }

            LogicalMessage::Delete { rel_id, key, old } => {
                if !self.state.process_messages {
                    return Ok(());
                }
                let tuple = key.or(old).ok_or_else(|| {
                    ServerError::Protocol("delete message without tuple".to_string())
                })?;
                self.append_delete(rel_id, &tuple)?;
                self.state.in_txn_stmt_id += 1;
                self.state.dirty_stream = true;
                Ok(())
            }

            LogicalMessage::Truncate { rel_ids, .. } => {
                if !self.state.process_messages {
                    return Ok(());
                }
                if self.delta.is_dirty() {
                    self.flush(FlushReason::Ddl)?;
                }
                for rel_id in rel_ids {
                    if let Some(rel) = self.relations.get(&rel_id) {
                        let sql = format!("TRUNCATE {}", rel.full_name());
                        self.with_engine(|conn| conn.execute(&sql).map(|_| ()))?;
                    }
                }
                self.state.in_txn_stmt_id += 1;
                Ok(())
            }

            LogicalMessage::Commit { commit_lsn, .. } => {
                if !self.state.process_messages {
                    // trailing commit of a replayed, already-durable
                    // transaction; progress must not move backward
                    self.state.dirty_txn = false;
                    self.state.in_txn_stmt_id = 0;
                    return Ok(());
                }
                self.state.last_commit_lsn = commit_lsn;
                self.state.dirty_txn = false;
                self.state.in_txn_stmt_id = 0;

                let now = Instant::now();
                let extend = self.state.may_extend_batch(self.delta.byte_size(), now);
                self.state.last_commit_time = Some(now);
                match extend {
                    Ok(()) => {
                        debug!("extending batch past {}", commit_lsn);
                        Ok(())
                    }
                    Err(reason) => {
                        debug!("flushing at {} ({:?})", commit_lsn, reason);
                        self.flush(FlushReason::Commit)
                    }
                }
            }

            LogicalMessage::StreamStart { .. } => {
                self.state.in_stream = true;
                Ok(())
            }
            LogicalMessage::StreamStop => {
                self.state.in_stream = false;
                Ok(())
            }
            LogicalMessage::StreamCommit { commit_lsn, .. } => {
                self.handle_logical(LogicalMessage::Commit {
                    commit_lsn,
                    end_lsn: commit_lsn,
                    commit_ts: 0,
                })
            }
            LogicalMessage::StreamAbort { xid, .. } => {
                // buffered rows of the aborted transaction cannot be torn
                // out of the columnar buffer; restart from the durable LSN
                self.abandon_batch();
                Err(ServerError::Replication(format!(
                    "stream abort for xid {}, restarting from durable position",
                    xid
                )))
            }

            LogicalMessage::Origin { .. }
            | LogicalMessage::TypeDef { .. }
            | LogicalMessage::Message { .. } => Ok(()),
        }
    }

    fn relation(&self, rel_id: u32) -> SResult<&RelationDescriptor> {
        self.relations.get(&rel_id).ok_or_else(|| {
            ServerError::Protocol(format!("change for unknown relation {}", rel_id))
        })
    }

    fn append_insert(&mut self, rel_id: u32, new: &TupleData) -> SResult<()> {
        let rel = self.relation(rel_id)?.clone();
        let row = rel.decode_tuple(new)?;
        let txn = TxnInfo {
            tag: &self.sub.name,
            server: &self.primary.host,
            group: &self.sub.publication,
            seq: self.state.current_txn_lsn.0,
            stmt_ord: self.state.in_txn_stmt_id,
        };
        self.delta.table_mut(&rel).append(ACTION_INSERT, txn, row)
    }

    fn append_delete(&mut self, rel_id: u32, tuple: &[crate::pgoutput::TupleCell]) -> SResult<()> {
        let rel = self.relation(rel_id)?.clone();
        let row = rel.decode_tuple(tuple)?;
        let txn = TxnInfo {
            tag: &self.sub.name,
            server: &self.primary.host,
            group: &self.sub.publication,
            seq: self.state.current_txn_lsn.0,
            stmt_ord: self.state.in_txn_stmt_id,
        };
        self.delta.table_mut(&rel).append(ACTION_DELETE, txn, row)
    }

    fn append_update(
        &mut self,
        rel_id: u32,
        key: Option<&[crate::pgoutput::TupleCell]>,
        old: Option<&[crate::pgoutput::TupleCell]>,
        new: &TupleData,
    ) -> SResult<()> {
        let rel = self.relation(rel_id)?.clone();
        let new_row = rel.decode_tuple(new)?;
        let txn = TxnInfo {
            tag: &self.sub.name,
            server: &self.primary.host,
            group: &self.sub.publication,
            seq: self.state.current_txn_lsn.0,
            stmt_ord: self.state.in_txn_stmt_id,
        };
        let table = self.delta.table_mut(&rel);
        match (key, old) {
            // key change: delete by old key, insert the new row
            (Some(key), _) => {
                let key_row = rel.decode_tuple(key)?;
                table.append(ACTION_DELETE, txn, key_row)?;
                table.append(ACTION_INSERT, txn, new_row)?;
            }
            // replica identity full: delete the old row, insert the new
            (None, Some(old)) => {
                let old_row = rel.decode_tuple(old)?;
                table.append(ACTION_DELETE, txn, old_row)?;
                table.append(ACTION_INSERT, txn, new_row)?;
            }
            // no old tuple: synthetic delete keeps the merge on the
            // UPSERT+DELETE path
            (None, None) => {
                table.mark_synthetic_delete();
                table.append(ACTION_INSERT, txn, new_row)?;
            }
        }
        Ok(())
    }

    /// Merge the delta and persist progress under one engine transaction.
    pub fn flush(&mut self, reason: FlushReason) -> SResult<()> {
        if !self.delta.is_dirty() && self.state.last_commit_lsn == self.state.last_written_lsn {
            return Ok(());
        }
        debug!(
            "flush '{}' ({:?}): {} rows, {} bytes, lsn {}",
            self.sub.name,
            reason,
            self.delta.row_count(),
            self.delta.byte_size(),
            self.state.last_commit_lsn
        );

        let sub_name = self.sub.name.clone();
        let publication = self.sub.publication.clone();
        let lsn = self.state.last_commit_lsn;
        let delta = &mut self.delta;
        let needs_begin = !self.state.ongoing_batch_txn;

        let pinned = self
            .pinned
            .as_ref()
            .ok_or_else(|| ServerError::Replication("engine connection not acquired".to_string()))?;
        let mut conn = pinned.blocking_lock();

        let result = (|| -> SResult<()> {
            if needs_begin {
                conn.begin()?;
            }
            delta.merge_into(conn.as_mut())?;
            store::write_progress(conn.as_mut(), &sub_name, &publication, lsn)?;
            conn.commit()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                drop(conn);
                self.delta.clear();
                self.state.after_flush();
                self.state.in_txn_stmt_id = 0;
                *self.progress.lock().unwrap() = lsn;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = conn.rollback() {
                    warn!("rollback after failed flush: {}", rollback_err);
                }
                drop(conn);
                // the un-acked suffix will be resent by the primary
                self.delta.clear();
                self.state.ongoing_batch_txn = false;
                self.state.dirty_txn = false;
                self.state.dirty_stream = false;
                self.state.in_txn_stmt_id = 0;
                Err(ServerError::Replication(format!("flush failed: {}", err)))
            }
        }
    }

    pub fn state(&self) -> &ReplicationState {
        &self.state
    }

    pub fn delta(&self) -> &Delta {
        &self.delta
    }
}
