//! Consensus seam for the partition resource manager
//!
//! The state machine consumes consensus through [`PartitionRaft`]: it
//! replicates batches through the current term and receives the committed
//! log back as an ordered stream of [`CommittedBatch`]es. The real broker
//! plugs its raft group in here; [`DirectRaft`] is the single-node
//! in-process implementation used by tests and embedded deployments, where
//! an append is committed the moment it is sequenced.

use crate::error::{Result, StmError};
use crate::model::{LogOffset, RecordBatch};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Options for a replicate call
#[derive(Debug, Clone, Copy)]
pub struct ReplicateOptions {
    /// Upper bound on the time spent waiting for the quorum
    pub timeout: Duration,
}

impl Default for ReplicateOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

/// Offsets assigned to a successfully replicated batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicateResult {
    pub base_offset: LogOffset,
    pub last_offset: LogOffset,
    pub term: i64,
}

/// A committed batch delivered to the state machine in log order
#[derive(Debug, Clone)]
pub struct CommittedBatch {
    pub base_offset: LogOffset,
    pub last_offset: LogOffset,
    pub term: i64,
    pub batch: RecordBatch,
}

/// The partition's raft group as seen by the state machine
#[async_trait]
pub trait PartitionRaft: Send + Sync {
    /// Current raft term
    fn term(&self) -> i64;

    /// Whether this replica is the current-term leader
    fn is_leader(&self) -> bool;

    /// Highest committed offset, -1 when the log is empty
    fn committed_offset(&self) -> LogOffset;

    /// Replicate a batch in `term`. Fails when the replica is not the
    /// leader of `term` anymore.
    async fn replicate(
        &self,
        term: i64,
        batch: RecordBatch,
        opts: ReplicateOptions,
    ) -> Result<ReplicateResult>;

    /// Take the ordered stream of committed batches. Yields each committed
    /// batch exactly once; the state machine harness owns the receiver.
    fn take_committed_stream(&self) -> Option<mpsc::UnboundedReceiver<CommittedBatch>>;
}

struct DirectRaftInner {
    next_offset: LogOffset,
    term: i64,
    leader: bool,
}

/// Single-node in-process raft: appends are sequenced and committed
/// immediately, then pushed onto the committed stream.
pub struct DirectRaft {
    inner: Mutex<DirectRaftInner>,
    committed_tx: mpsc::UnboundedSender<CommittedBatch>,
    committed_rx: Mutex<Option<mpsc::UnboundedReceiver<CommittedBatch>>>,
    replicate_calls: AtomicU64,
    fail_next: AtomicBool,
}

impl DirectRaft {
    /// Create a log whose first assigned offset is `first_offset`
    pub fn new(first_offset: LogOffset) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inner: Mutex::new(DirectRaftInner {
                next_offset: first_offset,
                term: 1,
                leader: true,
            }),
            committed_tx: tx,
            committed_rx: Mutex::new(Some(rx)),
            replicate_calls: AtomicU64::new(0),
            fail_next: AtomicBool::new(false),
        })
    }

    /// Move the replica to a new term, optionally as leader
    pub fn set_term(&self, term: i64, leader: bool) {
        let mut inner = self.inner.lock();
        inner.term = term;
        inner.leader = leader;
    }

    pub fn set_leader(&self, leader: bool) {
        self.inner.lock().leader = leader;
    }

    /// Number of replicate calls accepted so far
    pub fn replicate_calls(&self) -> u64 {
        self.replicate_calls.load(Ordering::Relaxed)
    }

    /// Make the next replicate call fail after consuming offsets, the way a
    /// dropped quorum does
    pub fn fail_next_replicate(&self) {
        self.fail_next.store(true, Ordering::Relaxed);
    }

    /// Commit a batch without going through leader replication, as if it
    /// arrived from the wire on a follower. Returns the assigned offsets.
    pub fn commit_external(&self, batch: RecordBatch) -> (LogOffset, LogOffset) {
        let committed = {
            let mut inner = self.inner.lock();
            let base = inner.next_offset;
            let last = base + i64::from(batch.identity.record_count.max(1)) - 1;
            inner.next_offset = last + 1;
            CommittedBatch {
                base_offset: base,
                last_offset: last,
                term: inner.term,
                batch,
            }
        };
        let offsets = (committed.base_offset, committed.last_offset);
        let _ = self.committed_tx.send(committed);
        offsets
    }
}

#[async_trait]
impl PartitionRaft for DirectRaft {
    fn term(&self) -> i64 {
        self.inner.lock().term
    }

    fn is_leader(&self) -> bool {
        self.inner.lock().leader
    }

    fn committed_offset(&self) -> LogOffset {
        self.inner.lock().next_offset - 1
    }

    async fn replicate(
        &self,
        term: i64,
        batch: RecordBatch,
        _opts: ReplicateOptions,
    ) -> Result<ReplicateResult> {
        let committed = {
            let mut inner = self.inner.lock();
            if !inner.leader {
                return Err(StmError::NotLeader);
            }
            if term != inner.term {
                return Err(StmError::NotLeader);
            }
            if self.fail_next.swap(false, Ordering::Relaxed) {
                // offsets are consumed: the entry went out but the quorum
                // never confirmed it
                let base = inner.next_offset;
                inner.next_offset = base + i64::from(batch.identity.record_count.max(1));
                return Err(StmError::replication("append", "quorum lost"));
            }
            self.replicate_calls.fetch_add(1, Ordering::Relaxed);
            let base = inner.next_offset;
            let last = base + i64::from(batch.identity.record_count.max(1)) - 1;
            inner.next_offset = last + 1;
            CommittedBatch {
                base_offset: base,
                last_offset: last,
                term: inner.term,
                batch,
            }
        };
        let result = ReplicateResult {
            base_offset: committed.base_offset,
            last_offset: committed.last_offset,
            term: committed.term,
        };
        debug!(
            base = result.base_offset,
            last = result.last_offset,
            term = result.term,
            "committed batch"
        );
        let _ = self.committed_tx.send(committed);
        Ok(result)
    }

    fn take_committed_stream(&self) -> Option<mpsc::UnboundedReceiver<CommittedBatch>> {
        self.committed_rx.lock().take()
    }
}
