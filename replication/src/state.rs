use std::time::{Duration, Instant};

use crate::lsn::Lsn;

/// Why a flush is being attempted; recorded for logging and the extend
/// decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// First commit after (re)start.
    Startup,
    Commit,
    TimeTick,
    /// Relation replaced or truncated: schema change boundary.
    Ddl,
    BufferSize,
    Shutdown,
}

/// Why a commit did not extend the running batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendDenied {
    NoBatch,
    FirstCommit,
    Deadline,
    BufferSize,
}

/// Batch extension limits.
pub const BATCH_DEADLINE: Duration = Duration::from_millis(200);
pub const BATCH_MAX_BYTES: usize = 128 * 1024 * 1024;

/// Per-subscription in-memory replication state.
#[derive(Debug)]
pub struct ReplicationState {
    /// Durable progress: everything at or below this is merged and the LSN
    /// persisted with it.
    pub last_written_lsn: Lsn,
    /// Most recent server WAL end seen, from data and keepalive messages.
    pub last_received_lsn: Lsn,
    /// Final LSN of the transaction currently being received.
    pub current_txn_lsn: Lsn,
    /// Commit LSN of the most recent logically-complete transaction.
    pub last_commit_lsn: Lsn,

    pub in_stream: bool,
    /// False while replaying messages already covered by durable progress.
    pub process_messages: bool,
    /// An engine transaction is open, accumulating batched commits.
    pub ongoing_batch_txn: bool,
    /// Rows of a not-yet-committed upstream transaction are in the buffer.
    pub dirty_txn: bool,
    /// Set from the first processed change until its commit flushes.
    pub dirty_stream: bool,
    /// Statement counter within the current upstream transaction.
    pub in_txn_stmt_id: u64,

    pub last_commit_time: Option<Instant>,
    /// Cleared by the first flush; the first commit always flushes.
    pub first_commit_pending: bool,
}

impl ReplicationState {
    pub fn new(start_lsn: Lsn) -> Self {
        ReplicationState {
            last_written_lsn: start_lsn,
            last_received_lsn: start_lsn,
            current_txn_lsn: Lsn::ZERO,
            last_commit_lsn: start_lsn,
            in_stream: false,
            process_messages: false,
            ongoing_batch_txn: false,
            dirty_txn: false,
            dirty_stream: false,
            in_txn_stmt_id: 0,
            last_commit_time: None,
            first_commit_pending: true,
        }
    }

    /// Durable progress never runs ahead of the logically-complete point.
    /// The received position is tracked from the live stream and can lag a
    /// locally-assigned commit in tests, so it is not part of the check.
    pub fn lsns_ordered(&self) -> bool {
        self.last_written_lsn <= self.last_commit_lsn
    }

    /// The may-extend-batch policy. Extend only while a batch transaction is
    /// open and none of the flush triggers fired.
    pub fn may_extend_batch(&self, delta_bytes: usize, now: Instant) -> Result<(), ExtendDenied> {
        if !self.ongoing_batch_txn {
            return Err(ExtendDenied::NoBatch);
        }
        if self.first_commit_pending {
            return Err(ExtendDenied::FirstCommit);
        }
        if let Some(last) = self.last_commit_time {
            if now.duration_since(last) >= BATCH_DEADLINE {
                return Err(ExtendDenied::Deadline);
            }
        }
        if delta_bytes >= BATCH_MAX_BYTES {
            return Err(ExtendDenied::BufferSize);
        }
        Ok(())
    }

    /// Called after a successful flush commit.
    pub fn after_flush(&mut self) {
        self.last_written_lsn = self.last_commit_lsn;
        self.ongoing_batch_txn = false;
        self.dirty_txn = false;
        self.dirty_stream = false;
        self.first_commit_pending = false;
    }
}
