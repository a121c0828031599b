//! The durable view of the state machine
//!
//! Log-state is advanced only by applying committed batches in log order;
//! the applier here is its sole writer. Rehydrated from the local snapshot
//! on start and from replay afterwards, so every mutation must be a pure
//! function of the committed log.

use super::expiration::ExpirationInfo;
use super::producer::{SeqEntryWrapper, SeqEntry};
use super::snapshot::AbortSegment;
use crate::model::{
    AbortIndex, BatchIdentity, ControlRecordType, FenceBatchData, KafkaOffset, LogOffset,
    PrepareMarker, ProducerEpoch, ProducerId, ProducerIdentity, TxRange, TxSeq,
};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// A declared open transaction: its coordinator-assigned sequence and the
/// coordinator partition responsible for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxData {
    pub tx_seq: TxSeq,
    pub tm_partition: i32,
}

/// Outcome of applying a fence batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceOutcome {
    /// The fence installed a new (or equal) epoch; carries the session it
    /// evicted, if any
    Applied { fenced: Option<ProducerIdentity> },
    /// The fence carried an epoch below the known one and was dropped
    Stale,
}

/// Durable per-partition transactional state
#[derive(Debug, Default)]
pub struct LogState {
    /// Highest observed epoch per producer id; monotonic
    pub fence_pid_epoch: HashMap<ProducerId, ProducerEpoch>,
    /// Offset envelope per transaction with at least one applied data batch
    pub ongoing_map: HashMap<ProducerIdentity, TxRange>,
    /// Ordered first-offsets over `ongoing_map` (LSO lower bounds)
    pub ongoing_set: BTreeSet<LogOffset>,
    /// Legacy prepare markers, treated as ongoing for LSO purposes
    pub prepared: HashMap<ProducerIdentity, PrepareMarker>,
    /// Aborted ranges still held in memory, append-only until offload
    pub aborted: Vec<TxRange>,
    /// Envelopes of aborted ranges offloaded to segment files
    pub abort_indexes: Vec<AbortIndex>,
    /// Most recently offloaded segment, kept in RAM to short-circuit reads
    pub last_abort_snapshot: Option<AbortSegment>,
    /// Per-producer sequence state; the only table also updated by
    /// admission (optimistically, before replication)
    pub seq_table: HashMap<ProducerIdentity, SeqEntryWrapper>,
    /// Declared open transactions
    pub current_txes: HashMap<ProducerIdentity, TxData>,
    /// Expiration tracking per declared transaction
    pub expiration: HashMap<ProducerIdentity, ExpirationInfo>,
}

impl LogState {
    pub fn new() -> Self {
        Self::default()
    }

    /// First offset of the earliest ongoing transaction
    pub fn first_ongoing(&self) -> Option<LogOffset> {
        self.ongoing_set.iter().next().copied()
    }

    /// Drop every trace of a producer session, including its fence entry
    pub fn forget(&mut self, pid: ProducerIdentity) {
        self.fence_pid_epoch.remove(&pid.id);
        if let Some(range) = self.ongoing_map.remove(&pid) {
            self.ongoing_set.remove(&range.first);
        }
        self.prepared.remove(&pid);
        self.seq_table.remove(&pid);
        self.current_txes.remove(&pid);
        self.expiration.remove(&pid);
    }

    /// Reset to empty, e.g. ahead of a raft snapshot install
    pub fn reset(&mut self) {
        self.fence_pid_epoch.clear();
        self.ongoing_map.clear();
        self.ongoing_set.clear();
        self.prepared.clear();
        self.aborted.clear();
        self.abort_indexes.clear();
        self.last_abort_snapshot = None;
        self.seq_table.clear();
        self.current_txes.clear();
        self.expiration.clear();
    }

    /// Apply a fence batch.
    ///
    /// A strictly higher epoch evicts the previous session by contract:
    /// no abort ranges are synthesized for whatever it had in flight.
    pub fn apply_fence(&mut self, data: &FenceBatchData) -> FenceOutcome {
        let pid = data.pid;
        let mut fenced = None;
        match self.fence_pid_epoch.get(&pid.id).copied() {
            Some(current) if pid.epoch < current => {
                debug!(%pid, current, "dropping stale fence");
                return FenceOutcome::Stale;
            }
            Some(current) if pid.epoch > current => {
                let old = ProducerIdentity::new(pid.id, current);
                debug!(%pid, old_epoch = current, "fencing producer session");
                self.evict_session(old);
                fenced = Some(old);
            }
            _ => {}
        }
        self.fence_pid_epoch.insert(pid.id, pid.epoch);

        if let Some(tx_seq) = data.tx_seq {
            let timeout =
                std::time::Duration::from_millis(data.tx_timeout_ms.unwrap_or(0).max(0) as u64);
            self.current_txes.insert(
                pid,
                TxData {
                    tx_seq,
                    tm_partition: data.tm_partition.unwrap_or(0),
                },
            );
            self.expiration.insert(pid, ExpirationInfo::new(timeout));
        }
        FenceOutcome::Applied { fenced }
    }

    /// Remove an evicted session's transactional state, keeping the fence
    /// table entry (it is about to be overwritten by the new epoch)
    fn evict_session(&mut self, pid: ProducerIdentity) {
        if let Some(range) = self.ongoing_map.remove(&pid) {
            self.ongoing_set.remove(&range.first);
        }
        self.prepared.remove(&pid);
        self.seq_table.remove(&pid);
        self.current_txes.remove(&pid);
        self.expiration.remove(&pid);
    }

    /// Apply a data batch: advance the sequence table and, for
    /// transactional batches, open or extend the ongoing range.
    pub fn apply_data(
        &mut self,
        bid: &BatchIdentity,
        base_offset: LogOffset,
        last_offset: LogOffset,
        kafka_base: KafkaOffset,
        term: i64,
    ) {
        let wrapper = self
            .seq_table
            .entry(bid.pid)
            .or_insert_with(|| SeqEntryWrapper::new(bid.pid));
        wrapper.entry.update(bid.last_seq, kafka_base);
        wrapper.term = term;

        if bid.is_transactional {
            if let Some(range) = self.ongoing_map.get_mut(&bid.pid) {
                range.last = last_offset;
            } else {
                self.ongoing_map
                    .insert(bid.pid, TxRange::new(bid.pid, base_offset, last_offset));
                self.ongoing_set.insert(base_offset);
            }
            if let Some(exp) = self.expiration.get_mut(&bid.pid) {
                exp.touch();
            }
        }
    }

    /// Apply a commit or abort marker. Returns the closed range for abort
    /// bookkeeping by the caller.
    pub fn apply_control(
        &mut self,
        pid: ProducerIdentity,
        kind: ControlRecordType,
    ) -> Option<TxRange> {
        let range = self.ongoing_map.remove(&pid);
        if let Some(r) = range {
            self.ongoing_set.remove(&r.first);
        }
        self.prepared.remove(&pid);
        self.current_txes.remove(&pid);
        self.expiration.remove(&pid);
        match kind {
            ControlRecordType::TxCommit => {
                debug!(%pid, "applied commit marker");
            }
            ControlRecordType::TxAbort => {
                debug!(%pid, "applied abort marker");
                if let Some(r) = range {
                    self.aborted.push(r);
                }
            }
            ControlRecordType::Unknown => {
                warn!(%pid, "ignoring unknown control marker");
            }
        }
        range
    }

    /// Record a legacy prepare marker
    pub fn apply_prepare(&mut self, marker: PrepareMarker) {
        self.prepared.insert(marker.pid, marker);
    }

    /// Current sequence state of a producer, if tracked
    pub fn seq_entry(&self, pid: ProducerIdentity) -> Option<&SeqEntry> {
        self.seq_table.get(&pid).map(|w| &w.entry)
    }

    /// Highest accepted sequence for a producer
    pub fn tail_seq(&self, pid: ProducerIdentity) -> Option<i32> {
        self.seq_entry(pid).map(|e| e.seq).filter(|s| *s >= 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(id: i64, epoch: i16) -> ProducerIdentity {
        ProducerIdentity::new(id, epoch)
    }

    fn fence(p: ProducerIdentity, tx_seq: Option<TxSeq>) -> FenceBatchData {
        FenceBatchData {
            pid: p,
            tx_seq,
            tx_timeout_ms: tx_seq.map(|_| 60_000),
            tm_partition: tx_seq.map(|_| 0),
        }
    }

    fn tx_bid(p: ProducerIdentity, first: i32, last: i32) -> BatchIdentity {
        BatchIdentity::new(p, first, last, true)
    }

    // ==================== Fence Tests ====================

    #[test]
    fn test_fence_installs_epoch() {
        let mut log = LogState::new();
        let outcome = log.apply_fence(&fence(pid(7, 0), Some(1)));
        assert_eq!(outcome, FenceOutcome::Applied { fenced: None });
        assert_eq!(log.fence_pid_epoch.get(&7), Some(&0));
        assert_eq!(log.current_txes.get(&pid(7, 0)).map(|t| t.tx_seq), Some(1));
        assert!(log.expiration.contains_key(&pid(7, 0)));
    }

    #[test]
    fn test_fence_epoch_monotonic() {
        let mut log = LogState::new();
        log.apply_fence(&fence(pid(7, 2), None));
        let outcome = log.apply_fence(&fence(pid(7, 1), None));
        assert_eq!(outcome, FenceOutcome::Stale);
        assert_eq!(log.fence_pid_epoch.get(&7), Some(&2));
    }

    #[test]
    fn test_fence_higher_epoch_evicts_session() {
        let mut log = LogState::new();
        log.apply_fence(&fence(pid(7, 0), Some(1)));
        log.apply_data(&tx_bid(pid(7, 0), 0, 4), 100, 104, 10, 1);
        assert!(log.ongoing_map.contains_key(&pid(7, 0)));

        let outcome = log.apply_fence(&fence(pid(7, 1), Some(1)));
        assert_eq!(
            outcome,
            FenceOutcome::Applied {
                fenced: Some(pid(7, 0))
            }
        );
        // the old session vanished without synthesizing abort ranges
        assert!(!log.ongoing_map.contains_key(&pid(7, 0)));
        assert!(log.ongoing_set.is_empty());
        assert!(log.aborted.is_empty());
        assert!(!log.seq_table.contains_key(&pid(7, 0)));
        assert_eq!(log.fence_pid_epoch.get(&7), Some(&1));
    }

    // ==================== Data Apply Tests ====================

    #[test]
    fn test_data_opens_then_extends_range() {
        let mut log = LogState::new();
        log.apply_data(&tx_bid(pid(5, 0), 0, 4), 150, 154, 10, 1);
        assert_eq!(
            log.ongoing_map.get(&pid(5, 0)),
            Some(&TxRange::new(pid(5, 0), 150, 154))
        );
        assert!(log.ongoing_set.contains(&150));

        log.apply_data(&tx_bid(pid(5, 0), 5, 9), 170, 174, 20, 1);
        assert_eq!(
            log.ongoing_map.get(&pid(5, 0)),
            Some(&TxRange::new(pid(5, 0), 150, 174))
        );
        // the set still tracks only the first offset
        assert_eq!(log.ongoing_set.len(), 1);
    }

    #[test]
    fn test_ongoing_set_mirrors_map() {
        let mut log = LogState::new();
        log.apply_data(&tx_bid(pid(1, 0), 0, 0), 10, 10, 0, 1);
        log.apply_data(&tx_bid(pid(2, 0), 0, 0), 20, 20, 1, 1);
        log.apply_data(&tx_bid(pid(3, 0), 0, 0), 30, 30, 2, 1);
        log.apply_control(pid(2, 0), ControlRecordType::TxCommit);

        let firsts: BTreeSet<_> = log.ongoing_map.values().map(|r| r.first).collect();
        assert_eq!(firsts, log.ongoing_set);
    }

    #[test]
    fn test_idempotent_data_updates_seq_only() {
        let mut log = LogState::new();
        let bid = BatchIdentity::new(pid(9, 0), 0, 4, false);
        log.apply_data(&bid, 100, 104, 10, 1);
        assert!(log.ongoing_map.is_empty());
        let entry = log.seq_entry(pid(9, 0)).unwrap();
        assert_eq!(entry.seq, 4);
        assert_eq!(entry.last_offset, 10);
    }

    // ==================== Control Apply Tests ====================

    #[test]
    fn test_commit_clears_tx_state() {
        let mut log = LogState::new();
        log.apply_fence(&fence(pid(5, 0), Some(1)));
        log.apply_data(&tx_bid(pid(5, 0), 0, 0), 150, 150, 10, 1);

        log.apply_control(pid(5, 0), ControlRecordType::TxCommit);
        assert!(log.ongoing_map.is_empty());
        assert!(log.ongoing_set.is_empty());
        assert!(log.current_txes.is_empty());
        assert!(log.expiration.is_empty());
        assert!(log.aborted.is_empty());
        // dedup state survives the transaction boundary
        assert!(log.seq_table.contains_key(&pid(5, 0)));
    }

    #[test]
    fn test_abort_records_range() {
        let mut log = LogState::new();
        log.apply_fence(&fence(pid(5, 0), Some(1)));
        log.apply_data(&tx_bid(pid(5, 0), 0, 0), 150, 180, 10, 1);

        log.apply_control(pid(5, 0), ControlRecordType::TxAbort);
        assert_eq!(log.aborted, vec![TxRange::new(pid(5, 0), 150, 180)]);
        assert!(log.ongoing_map.is_empty());
    }

    #[test]
    fn test_abort_without_data_records_nothing() {
        let mut log = LogState::new();
        log.apply_fence(&fence(pid(5, 0), Some(1)));
        log.apply_control(pid(5, 0), ControlRecordType::TxAbort);
        assert!(log.aborted.is_empty());
        assert!(log.current_txes.is_empty());
    }

    // ==================== Prepare Tests ====================

    #[test]
    fn test_prepare_recorded_until_control() {
        let mut log = LogState::new();
        let marker = PrepareMarker {
            tm_partition: 1,
            tx_seq: 3,
            pid: pid(4, 0),
        };
        log.apply_prepare(marker);
        assert_eq!(log.prepared.get(&pid(4, 0)), Some(&marker));
        log.apply_control(pid(4, 0), ControlRecordType::TxCommit);
        assert!(log.prepared.is_empty());
    }

    // ==================== Forget Tests ====================

    #[test]
    fn test_forget_clears_everything() {
        let mut log = LogState::new();
        log.apply_fence(&fence(pid(5, 0), Some(1)));
        log.apply_data(&tx_bid(pid(5, 0), 0, 0), 150, 150, 10, 1);

        log.forget(pid(5, 0));
        assert!(log.fence_pid_epoch.is_empty());
        assert!(log.ongoing_map.is_empty());
        assert!(log.ongoing_set.is_empty());
        assert!(log.seq_table.is_empty());
        assert!(log.current_txes.is_empty());
        assert!(log.expiration.is_empty());
    }
}
